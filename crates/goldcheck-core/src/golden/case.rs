//! Golden cases and their JSON-lines file format.
//!
//! Each line of a golden file is one JSON object:
//!
//! ```json
//! {"prompt": "I love to", "tokens": [1, 306, 5360, 304], "logits": [[...], ...]}
//! ```
//!
//! `logits` has one row per token position and one column per vocabulary
//! entry. Blank lines are ignored.

use crate::error::{GoldcheckError, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};

/// A single golden test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldenCase {
    /// Prompt text the tokens were produced from.
    pub prompt: String,
    /// Token ids fed to the model.
    pub tokens: Vec<u32>,
    /// Reference logits: [seq_len, vocab_size].
    pub logits: Vec<Vec<f32>>,
}

impl GoldenCase {
    /// Create a new case.
    pub fn new(prompt: impl Into<String>, tokens: Vec<u32>, logits: Vec<Vec<f32>>) -> Self {
        Self {
            prompt: prompt.into(),
            tokens,
            logits,
        }
    }

    /// Number of logit rows.
    pub fn seq_len(&self) -> usize {
        self.logits.len()
    }

    /// Number of logit columns.
    pub fn vocab_size(&self) -> usize {
        self.logits.first().map_or(0, Vec::len)
    }

    /// Reference logits as a [seq_len, vocab_size] f32 tensor.
    pub fn logits_tensor(&self, device: &Device) -> Result<Tensor> {
        let rows = self.seq_len();
        let cols = self.vocab_size();
        let flat: Vec<f32> = self.logits.iter().flatten().copied().collect();
        if flat.len() != rows * cols {
            return Err(GoldcheckError::ShapeMismatch(format!(
                "golden logits are ragged: {} values for {} x {}",
                flat.len(),
                rows,
                cols
            )));
        }
        Ok(Tensor::from_vec(flat, (rows, cols), device)?)
    }

    fn check_shape(&self, line: usize) -> Result<()> {
        if self.logits.is_empty() {
            return Err(GoldcheckError::data_format(line, "logits are empty"));
        }
        let width = self.vocab_size();
        if width == 0 {
            return Err(GoldcheckError::data_format(line, "logit rows are empty"));
        }
        if let Some((row, values)) = self
            .logits
            .iter()
            .enumerate()
            .find(|(_, values)| values.len() != width)
        {
            return Err(GoldcheckError::data_format(
                line,
                format!(
                    "logit row {} has {} columns, expected {}",
                    row,
                    values.len(),
                    width
                ),
            ));
        }
        Ok(())
    }
}

/// Reads golden cases from a JSON-lines file.
#[derive(Debug, Clone)]
pub struct GoldenCaseLoader {
    path: PathBuf,
}

impl GoldenCaseLoader {
    /// Create a loader for the given file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path being read.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lazily iterate over the cases in file order.
    pub fn cases(&self) -> Result<GoldenCases<BufReader<File>>> {
        let file = File::open(&self.path)?;
        Ok(GoldenCases::new(BufReader::new(file)))
    }

    /// Read every case, stopping at the first malformed one.
    pub fn load_all(&self) -> Result<Vec<GoldenCase>> {
        self.cases()?.collect()
    }
}

/// Lazy iterator over golden cases.
#[derive(Debug)]
pub struct GoldenCases<R> {
    lines: Lines<R>,
    line: usize,
}

impl<R: BufRead> GoldenCases<R> {
    /// Iterate over cases from any buffered reader.
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
        }
    }
}

impl<R: BufRead> Iterator for GoldenCases<R> {
    type Item = Result<GoldenCase>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(e) => return Some(Err(e.into())),
            };
            self.line += 1;

            if text.trim().is_empty() {
                continue;
            }

            let line = self.line;
            let parsed = serde_json::from_str::<GoldenCase>(&text)
                .map_err(|e| GoldcheckError::data_format(line, e.to_string()))
                .and_then(|case| case.check_shape(line).map(|()| case));
            return Some(parsed);
        }
    }
}

/// Writes golden cases as JSON lines.
#[derive(Debug)]
pub struct GoldenCaseWriter<W: Write> {
    writer: W,
    written: usize,
}

impl GoldenCaseWriter<BufWriter<File>> {
    /// Create (or truncate) a golden file.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> GoldenCaseWriter<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    /// Append one case.
    pub fn write(&mut self, case: &GoldenCase) -> Result<()> {
        serde_json::to_writer(&mut self.writer, case)?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    /// Number of cases written so far.
    pub fn written(&self) -> usize {
        self.written
    }

    /// Flush and return the inner writer.
    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(text: &str) -> Vec<Result<GoldenCase>> {
        GoldenCases::new(Cursor::new(text.as_bytes())).collect()
    }

    #[test]
    fn reads_cases_in_order() {
        let text = concat!(
            r#"{"prompt": "I love to", "tokens": [1, 2, 3], "logits": [[0.1, 0.2], [0.3, 0.4], [0.5, 0.6]]}"#,
            "\n",
            r#"{"prompt": "Today is", "tokens": [4, 5], "logits": [[1.0, 2.0], [3.0, 4.0]]}"#,
            "\n"
        );

        let cases: Vec<GoldenCase> = parse(text).into_iter().map(|c| c.unwrap()).collect();

        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].prompt, "I love to");
        assert_eq!(cases[0].tokens, vec![1, 2, 3]);
        assert_eq!(cases[0].seq_len(), 3);
        assert_eq!(cases[0].vocab_size(), 2);
        assert_eq!(cases[1].prompt, "Today is");
    }

    #[test]
    fn blank_lines_skipped() {
        let text = "\n\n{\"prompt\": \"a\", \"tokens\": [1], \"logits\": [[0.0]]}\n   \n";
        let cases = parse(text);
        assert_eq!(cases.len(), 1);
        assert!(cases[0].is_ok());
    }

    #[test]
    fn missing_field_reports_line() {
        let text = concat!(
            r#"{"prompt": "ok", "tokens": [1], "logits": [[0.0]]}"#,
            "\n",
            r#"{"prompt": "no logits", "tokens": [1]}"#,
            "\n"
        );

        let cases = parse(text);
        assert!(cases[0].is_ok());
        match &cases[1] {
            Err(GoldcheckError::DataFormat { line, message }) => {
                assert_eq!(*line, 2);
                assert!(message.contains("logits"), "message: {}", message);
            }
            other => panic!("expected data format error, got {:?}", other),
        }
    }

    #[test]
    fn malformed_json_rejected() {
        let cases = parse("{not json}\n");
        assert!(matches!(
            cases[0],
            Err(GoldcheckError::DataFormat { line: 1, .. })
        ));
    }

    #[test]
    fn ragged_logits_rejected() {
        let cases = parse(r#"{"prompt": "x", "tokens": [1, 2], "logits": [[0.0, 1.0], [2.0]]}"#);
        match &cases[0] {
            Err(GoldcheckError::DataFormat { message, .. }) => {
                assert!(message.contains("row 1"));
            }
            other => panic!("expected data format error, got {:?}", other),
        }
    }

    #[test]
    fn logits_tensor_shape() {
        let case = GoldenCase::new("p", vec![1, 2], vec![vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]);
        let tensor = case.logits_tensor(&Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[2, 3]);
        let values: Vec<Vec<f32>> = tensor.to_vec2().unwrap();
        assert_eq!(values, case.logits);
    }

    #[test]
    fn writer_output_reads_back() {
        let cases = vec![
            GoldenCase::new("first", vec![1], vec![vec![0.5, -0.5]]),
            GoldenCase::new("second", vec![2, 3], vec![vec![1.0, 2.0], vec![3.0, 4.0]]),
        ];

        let mut writer = GoldenCaseWriter::new(Vec::new());
        for case in &cases {
            writer.write(case).unwrap();
        }
        assert_eq!(writer.written(), 2);
        let bytes = writer.finish().unwrap();

        let read: Vec<GoldenCase> = GoldenCases::new(Cursor::new(bytes))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(read, cases);
    }

    #[test]
    fn loader_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assets").join("golden_data_tiny.jsonl");

        let mut writer = GoldenCaseWriter::create(&path).unwrap();
        writer
            .write(&GoldenCase::new("I love to", vec![1, 2, 3], vec![vec![0.0; 4]; 3]))
            .unwrap();
        writer.finish().unwrap();

        let loader = GoldenCaseLoader::new(&path);
        let cases = loader.load_all().unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(loader.path(), path.as_path());
    }

    #[test]
    fn loader_missing_file() {
        let loader = GoldenCaseLoader::new("/nonexistent/golden_data.jsonl");
        assert!(matches!(loader.cases(), Err(GoldcheckError::IoError(_))));
    }
}
