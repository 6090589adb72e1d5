use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use serde_json::{Map, Value, json};

/// 構造化JSONログ（1行1レコード）。パス `-` で標準出力。
pub struct StructuredLogger {
    pub to_stdout: bool,
    file: Option<Mutex<BufWriter<File>>>,
}

impl StructuredLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let path = path.as_ref();
        if path.as_os_str() == "-" {
            return Ok(Self {
                to_stdout: true,
                file: None,
            });
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let f = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            to_stdout: false,
            file: Some(Mutex::new(BufWriter::with_capacity(1 << 16, f))),
        })
    }

    pub fn write_json(&self, v: &Value) {
        if self.to_stdout {
            write_line(&mut std::io::stdout().lock(), v);
        } else if let Some(ref file) = self.file {
            match file.lock() {
                Ok(mut w) => {
                    write_line(&mut *w, v);
                }
                Err(_) => log::warn!("structured log writer is poisoned; dropping record"),
            }
        }
    }

    /// `event` と `ts` を付けて1レコード書く
    pub fn event(&self, event: &str, fields: Map<String, Value>) {
        let mut record = Map::new();
        record.insert("ts".into(), json!(chrono::Utc::now().to_rfc3339()));
        record.insert("event".into(), json!(event));
        record.extend(fields);
        self.write_json(&Value::Object(record));
    }

    pub fn flush(&self) -> std::io::Result<()> {
        match self.file {
            Some(ref file) => match file.lock() {
                Ok(mut w) => w.flush(),
                Err(_) => Ok(()),
            },
            None => Ok(()),
        }
    }
}

/// 1レコード書く。失敗しても学習は止めず警告だけ残す
fn write_line<W: Write>(w: &mut W, v: &Value) -> bool {
    match writeln!(w, "{v}") {
        Ok(()) => true,
        Err(e) => {
            log::warn!("failed to write structured log record: {e}");
            false
        }
    }
}

impl Drop for StructuredLogger {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_line_reports_failure() {
        let v = json!({"event": "step"});
        assert!(!write_line(&mut BrokenPipe, &v));

        let mut ok = Vec::new();
        assert!(write_line(&mut ok, &v));
        assert_eq!(String::from_utf8(ok).unwrap(), "{\"event\":\"step\"}\n");
    }

    #[test]
    fn test_appends_jsonl_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/train.jsonl");
        {
            let logger = StructuredLogger::new(&path).unwrap();
            let mut fields = Map::new();
            fields.insert("epoch".into(), json!(1));
            logger.event("epoch", fields);
        }
        {
            let logger = StructuredLogger::new(&path).unwrap();
            logger.event("done", Map::new());
            logger.flush().unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "epoch");
        assert_eq!(lines[0]["epoch"], 1);
        assert!(lines[1]["ts"].is_string());
    }
}
