//! Grab encoding and the output sink
//!
//! Grabs serialize to one JSON object per line. In non-verbose mode a
//! processor walks the value tree first, dropping debug-only members
//! and empty values. The sink owns the output handle: stdout for `-`,
//! otherwise the named file, truncated.

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::info;

use crate::error::{GrabError, Result};
use crate::grab::Grab;

/// Serialize a grab, stripping debug fields unless requested.
pub fn encode_grab(grab: &Grab, include_debug: bool) -> Result<Vec<u8>> {
    let value = serde_json::to_value(grab)
        .map_err(|e| GrabError::output(format!("cannot serialize grab: {}", e)))?;
    let value = if include_debug {
        value
    } else {
        Processor { verbose: false }.process(value)
    };
    serde_json::to_vec(&value).map_err(|e| GrabError::output(format!("cannot encode grab: {}", e)))
}

/// Walks an encoded record and elides what the verbosity level hides.
#[derive(Debug, Clone, Copy)]
pub struct Processor {
    pub verbose: bool,
}

impl Processor {
    pub fn process(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (key, inner) in map {
                    if !self.verbose && is_debug_key(&key) {
                        continue;
                    }
                    let processed = self.process(inner);
                    if is_empty_value(&processed) {
                        continue;
                    }
                    out.insert(key, processed);
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.process(v)).collect())
            }
            other => other,
        }
    }
}

fn is_debug_key(key: &str) -> bool {
    key == "debug" || key.starts_with("debug_")
}

/// Zero values and empty containers are omitted from output records.
fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

/// Open the output destination: stdout for `-`, else the named file.
pub async fn open_sink(path: &str) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
    if path == "-" {
        Ok(Box::new(tokio::io::stdout()))
    } else {
        let file = tokio::fs::File::create(path)
            .await
            .map_err(|e| GrabError::output(format!("cannot create {}: {}", path, e)))?;
        Ok(Box::new(file))
    }
}

/// Drain encoded records onto the writer, newline-delimited.
pub async fn run_sink<W: AsyncWrite + Unpin>(
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut writer: W,
) -> Result<()> {
    let mut written = 0u64;
    while let Some(record) = rx.recv().await {
        writer
            .write_all(&record)
            .await
            .map_err(|e| GrabError::output(format!("write failed: {}", e)))?;
        writer
            .write_all(b"\n")
            .await
            .map_err(|e| GrabError::output(format!("write failed: {}", e)))?;
        written += 1;
    }
    writer
        .flush()
        .await
        .map_err(|e| GrabError::output(format!("flush failed: {}", e)))?;
    info!(records = written, "output sink finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_processor_strips_debug_and_empties() {
        let record = json!({
            "ip": "10.0.0.1",
            "debug": {"socket": 3},
            "data": {
                "banner": {
                    "status": "success",
                    "error": null,
                    "debug_raw": "ff00",
                    "result": {"banner": "hi", "length": 0, "products": []}
                }
            }
        });
        let out = Processor { verbose: false }.process(record);
        assert_eq!(
            out,
            json!({
                "ip": "10.0.0.1",
                "data": {"banner": {"status": "success", "result": {"banner": "hi"}}}
            })
        );
    }

    #[test]
    fn test_processor_verbose_keeps_debug() {
        let record = json!({"debug": {"socket": 3}, "x": 1});
        let out = Processor { verbose: true }.process(record);
        assert_eq!(out, json!({"debug": {"socket": 3}, "x": 1}));
    }

    #[test]
    fn test_processor_drops_emptied_containers() {
        // An object that only held debug members vanishes entirely.
        let record = json!({"a": {"debug_x": 1}, "b": "keep"});
        let out = Processor { verbose: false }.process(record);
        assert_eq!(out, json!({"b": "keep"}));
    }

    #[tokio::test]
    async fn test_run_sink_writes_lines() {
        let (tx, rx) = mpsc::channel(4);
        let (writer, mut reader) = tokio::io::duplex(4096);

        let sink = tokio::spawn(run_sink(rx, writer));
        tx.send(b"{\"a\":1}".to_vec()).await.unwrap();
        tx.send(b"{\"b\":2}".to_vec()).await.unwrap();
        drop(tx);
        sink.await.unwrap().unwrap();

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"{\"a\":1}\n{\"b\":2}\n");
    }
}
