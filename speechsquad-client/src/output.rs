//! Result artifacts.
//!
//! Three JSON sinks plus one WAV file per answer, shared by every finishing
//! task behind a single mutex: a newline-delimited question file, a
//! single-object answer map written at the end of the run, and a
//! newline-delimited record of synthesized audio paths with inter-response
//! latencies. Answer audio is 22050 Hz mono float.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::json;

use crate::audio::AudioClip;
use crate::error::ClientError;
use crate::task::TaskResults;

pub struct OutputSinks {
    root: PathBuf,
    answer_path: PathBuf,
    inner: Mutex<SinkState>,
}

struct SinkState {
    question_file: BufWriter<File>,
    wave_file: BufWriter<File>,
    answers: BTreeMap<String, String>,
    wav_index: u64,
}

/// Create a directory the way the original tooling does: an existing
/// directory is an error unless explicitly tolerated.
pub fn create_output_directory(path: &Path, allow_existing: bool) -> Result<(), ClientError> {
    match std::fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            if allow_existing {
                Ok(())
            } else {
                Err(ClientError::AlreadyExists(format!(
                    "failed to create directory {}: {e}",
                    path.display()
                )))
            }
        }
        Err(e) => Err(ClientError::Internal(format!(
            "failed to create directory {}: {e}",
            path.display()
        ))),
    }
}

impl OutputSinks {
    pub fn create(
        root: &Path,
        question_filename: &str,
        answer_filename: &str,
        wave_filename: &str,
    ) -> Result<Self, ClientError> {
        let open = |name: &str| -> Result<BufWriter<File>, ClientError> {
            let path = root.join(name);
            File::create(&path)
                .map(BufWriter::new)
                .map_err(|e| ClientError::Internal(format!("cannot open {}: {e}", path.display())))
        };
        Ok(Self {
            root: root.to_path_buf(),
            answer_path: root.join(answer_filename),
            inner: Mutex::new(SinkState {
                question_file: open(question_filename)?,
                wave_file: open(wave_filename)?,
                answers: BTreeMap::new(),
                wav_index: 0,
            }),
        })
    }

    /// Record one completed stream. Streams that never produced a question
    /// still get a question line; everything else is only written for
    /// streams with a recognized question.
    pub fn record(&self, clip: &AudioClip, results: &TaskResults) -> Result<(), ClientError> {
        let mut inner = self.inner.lock();
        println!("-----------------------------------------------------------");
        println!("File: {}", clip.filename);

        if results.squad_question.is_empty() {
            let line = json!({ "audio_filepath": clip.filename, "text": "" });
            writeln!(inner.question_file, "{line}")
                .map_err(|e| ClientError::Internal(format!("question file write failed: {e}")))?;
            return Ok(());
        }

        let line = json!({ "audio_filepath": clip.filename, "text": results.squad_question });
        writeln!(inner.question_file, "{line}")
            .map_err(|e| ClientError::Internal(format!("question file write failed: {e}")))?;
        inner
            .answers
            .insert(clip.question_id.clone(), results.squad_answer.clone());

        // Empty audio is recorded as an internal error but still produces
        // the remaining artifacts, matching the rest of the tooling.
        let empty_audio = results.audio_content.is_empty();

        let wav_path = self.root.join(format!("{}.wav", inner.wav_index));
        inner.wav_index += 1;
        write_float_wav(&wav_path, &results.audio_content)?;

        let line = json!({
            "qid": clip.question_id,
            "text": results.squad_answer,
            "synthesized_audio_path": wav_path.to_string_lossy(),
            "latencies": results.response_intervals_ms,
        });
        writeln!(inner.wave_file, "{line}")
            .map_err(|e| ClientError::Internal(format!("wave file write failed: {e}")))?;

        println!("SQUAD question: {}", results.squad_question);
        println!("SQUAD answer: {}", results.squad_answer);
        println!("Output File: {}", wav_path.display());

        if empty_audio {
            return Err(ClientError::Internal(
                "no audio received in the response".to_string(),
            ));
        }
        Ok(())
    }

    /// Flush the line sinks and write the single-object answer map.
    pub fn finish(&self) -> Result<(), ClientError> {
        let mut inner = self.inner.lock();
        inner
            .question_file
            .flush()
            .map_err(|e| ClientError::Internal(format!("flush failed: {e}")))?;
        inner
            .wave_file
            .flush()
            .map_err(|e| ClientError::Internal(format!("flush failed: {e}")))?;
        let file = File::create(&self.answer_path).map_err(|e| {
            ClientError::Internal(format!("cannot open {}: {e}", self.answer_path.display()))
        })?;
        serde_json::to_writer(BufWriter::new(file), &inner.answers)
            .map_err(|e| ClientError::Internal(format!("answer file write failed: {e}")))
    }
}

/// 22050 Hz mono 32-bit float WAV, the synthesis output format.
fn write_float_wav(path: &Path, audio: &[u8]) -> Result<(), ClientError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 22050,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| ClientError::Internal(format!("cannot create {}: {e}", path.display())))?;
    for chunk in audio.chunks_exact(4) {
        let sample = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        writer
            .write_sample(sample)
            .map_err(|e| ClientError::Internal(format!("wav write failed: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| ClientError::Internal(format!("wav finalize failed: {e}")))
}
