//! Transcript archival: gzipped JSONL in the blob store.
//!
//! On reset the full message history lands at
//! `agents/{agentId}/sessions/{sessionId}.jsonl.gz`; compaction writes the
//! truncated head as `…-part{N}.jsonl.gz`. Custom metadata records counts
//! and timestamps so listings never need to decompress anything.

use std::io::{Read, Write};
use std::sync::Arc;

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

use sy_domain::error::{Error, Result};
use sy_domain::trace::TraceEvent;
use sy_store::{BlobMeta, BlobStore};

pub struct TranscriptArchiver {
    blob: Arc<dyn BlobStore>,
}

impl TranscriptArchiver {
    pub fn new(blob: Arc<dyn BlobStore>) -> Self {
        Self { blob }
    }

    /// Archive a full transcript. Returns the blob key written.
    pub fn archive(
        &self,
        agent_id: &str,
        session_key: &str,
        session_id: &str,
        messages: &[Value],
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<String> {
        let key = format!("agents/{agent_id}/sessions/{session_id}.jsonl.gz");
        self.write_archive(
            &key,
            session_key,
            session_id,
            agent_id,
            messages,
            input_tokens,
            output_tokens,
        )?;
        Ok(key)
    }

    /// Archive the compacted-away head of a transcript as a numbered part.
    pub fn archive_part(
        &self,
        agent_id: &str,
        session_key: &str,
        session_id: &str,
        part: u32,
        messages: &[Value],
    ) -> Result<String> {
        let key = format!("agents/{agent_id}/sessions/{session_id}-part{part}.jsonl.gz");
        self.write_archive(&key, session_key, session_id, agent_id, messages, 0, 0)?;
        Ok(key)
    }

    fn write_archive(
        &self,
        key: &str,
        session_key: &str,
        session_id: &str,
        agent_id: &str,
        messages: &[Value],
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<()> {
        let mut jsonl = String::new();
        for message in messages {
            jsonl.push_str(&serde_json::to_string(message).map_err(Error::Json)?);
            jsonl.push('\n');
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(jsonl.as_bytes()).map_err(Error::Io)?;
        let bytes = encoder.finish().map_err(Error::Io)?;

        let meta = BlobMeta::of("application/gzip")
            .with("sessionKey", session_key)
            .with("sessionId", session_id)
            .with("agentId", agent_id)
            .with("messageCount", messages.len().to_string())
            .with("archivedAt", Utc::now().to_rfc3339())
            .with("inputTokens", input_tokens.to_string())
            .with("outputTokens", output_tokens.to_string())
            .with("totalTokens", (input_tokens + output_tokens).to_string());
        self.blob.put(key, &bytes, meta)?;

        TraceEvent::TranscriptArchived {
            session_id: session_id.to_owned(),
            messages: messages.len(),
            blob_key: key.to_owned(),
        }
        .emit();
        Ok(())
    }

    /// Read an archive back as the original message array.
    pub fn read(&self, blob_key: &str) -> Result<Option<Vec<Value>>> {
        let Some((bytes, _meta)) = self.blob.get(blob_key)? else {
            return Ok(None);
        };
        let mut decoder = GzDecoder::new(bytes.as_slice());
        let mut jsonl = String::new();
        decoder.read_to_string(&mut jsonl).map_err(Error::Io)?;

        let mut messages = Vec::new();
        for line in jsonl.lines() {
            if line.trim().is_empty() {
                continue;
            }
            messages.push(
                serde_json::from_str(line)
                    .map_err(|e| Error::Store(format!("corrupt transcript line: {e}")))?,
            );
        }
        Ok(Some(messages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sy_store::MemoryBlobStore;

    fn archiver() -> (Arc<MemoryBlobStore>, TranscriptArchiver) {
        let blob = Arc::new(MemoryBlobStore::new());
        let archiver = TranscriptArchiver::new(blob.clone() as Arc<dyn BlobStore>);
        (blob, archiver)
    }

    #[test]
    fn archive_then_read_yields_original_messages() {
        let (_, archiver) = archiver();
        let messages = vec![
            json!({"role": "user", "content": "hello"}),
            json!({"role": "assistant", "content": [{"type": "text", "text": "hi\nthere"}]}),
        ];
        let key = archiver
            .archive("main", "agent:main:main", "s1", &messages, 12, 34)
            .unwrap();
        assert_eq!(key, "agents/main/sessions/s1.jsonl.gz");

        let back = archiver.read(&key).unwrap().unwrap();
        assert_eq!(back, messages);
    }

    #[test]
    fn metadata_records_counts() {
        let (blob, archiver) = archiver();
        let messages = vec![json!({"role": "user", "content": "x"})];
        let key = archiver
            .archive("main", "agent:main:main", "s1", &messages, 5, 7)
            .unwrap();

        let (_, meta) = blob.get(&key).unwrap().unwrap();
        assert_eq!(meta.content_type, "application/gzip");
        assert_eq!(meta.custom.get("messageCount").map(String::as_str), Some("1"));
        assert_eq!(meta.custom.get("totalTokens").map(String::as_str), Some("12"));
        assert!(meta.custom.contains_key("archivedAt"));
    }

    #[test]
    fn parts_get_numbered_keys() {
        let (_, archiver) = archiver();
        let key = archiver
            .archive_part("main", "agent:main:main", "s1", 2, &[json!({"role": "user"})])
            .unwrap();
        assert_eq!(key, "agents/main/sessions/s1-part2.jsonl.gz");
        assert_eq!(archiver.read(&key).unwrap().unwrap().len(), 1);
    }

    #[test]
    fn missing_archive_reads_as_none() {
        let (_, archiver) = archiver();
        assert!(archiver.read("agents/x/sessions/nope.jsonl.gz").unwrap().is_none());
    }
}
