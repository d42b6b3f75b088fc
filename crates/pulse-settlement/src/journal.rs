//! Append-only ledger journal (JSON lines)
//!
//! Every ledger mutation is appended and fsynced before it is applied in
//! memory. Replaying the file rebuilds accounts, balances, receipts and the
//! payout intents a crash left open.

use pulse_core::{Amount, PayoutReceipt, ValidatorId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::LedgerError;
use crate::ledger::PayoutIntent;

/// One durable ledger event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JournalEntry {
    AccountOpened {
        validator_id: ValidatorId,
        payout_address: String,
    },
    Credited {
        validator_id: ValidatorId,
        amount: Amount,
    },
    /// Written before the external transfer is attempted
    PayoutStarted { intent: PayoutIntent },
    PayoutCompleted {
        idempotency_key: String,
        receipt: PayoutReceipt,
    },
    PayoutReverted {
        idempotency_key: String,
        validator_id: ValidatorId,
        amount: Amount,
        reason: String,
    },
}

/// Append handle on the journal file
pub struct Journal {
    path: PathBuf,
    file: Mutex<fs::File>,
}

impl Journal {
    /// Open (or create) the journal at `path`, returning the existing entries
    ///
    /// A malformed final line is a torn write from a crash. It is dropped and
    /// cut from the file so the next append starts on a clean line. A
    /// malformed line anywhere else is corruption.
    pub async fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<JournalEntry>), LedgerError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let replay = if path.exists() {
            let content = fs::read_to_string(&path).await?;
            let replay = parse_entries(&content)?;
            if replay.valid_len < content.len() {
                warn!(
                    "Truncating journal {:?} from {} to {} bytes",
                    path,
                    content.len(),
                    replay.valid_len
                );
                let file = fs::OpenOptions::new().write(true).open(&path).await?;
                file.set_len(replay.valid_len as u64).await?;
                file.sync_all().await?;
            }
            replay
        } else {
            Replay::default()
        };

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        // Last record was complete but lost its newline
        if !replay.terminated {
            file.write_all(b"\n").await?;
            file.sync_data().await?;
        }

        debug!(
            "Opened journal {:?} with {} entries",
            path,
            replay.entries.len()
        );

        Ok((
            Self {
                path,
                file: Mutex::new(file),
            },
            replay.entries,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and wait until it is on disk
    pub async fn append(&self, entry: &JournalEntry) -> Result<(), LedgerError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }
}

struct Replay {
    entries: Vec<JournalEntry>,
    /// Bytes up to the end of the last readable line
    valid_len: usize,
    /// Whether those bytes end in a newline (or are empty)
    terminated: bool,
}

impl Default for Replay {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            valid_len: 0,
            terminated: true,
        }
    }
}

fn parse_entries(content: &str) -> Result<Replay, LedgerError> {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let last = lines.iter().rposition(|line| !line.trim().is_empty());

    let mut replay = Replay::default();
    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            replay.valid_len += line.len();
            continue;
        }
        match serde_json::from_str::<JournalEntry>(line.trim()) {
            Ok(entry) => {
                replay.entries.push(entry);
                replay.valid_len += line.len();
            }
            Err(e) if Some(index) == last => {
                warn!("Dropping torn final journal line {}: {}", index + 1, e);
                break;
            }
            Err(e) => {
                return Err(LedgerError::Corrupt {
                    line: index + 1,
                    detail: e.to_string(),
                });
            }
        }
    }
    replay.terminated = replay.valid_len == 0 || content[..replay.valid_len].ends_with('\n');
    Ok(replay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_append_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger/journal.jsonl");

        {
            let (journal, entries) = Journal::open(&path).await.unwrap();
            assert!(entries.is_empty());
            journal
                .append(&JournalEntry::AccountOpened {
                    validator_id: "v-1".to_string(),
                    payout_address: "addr".to_string(),
                })
                .await
                .unwrap();
            journal
                .append(&JournalEntry::Credited {
                    validator_id: "v-1".to_string(),
                    amount: 100,
                })
                .await
                .unwrap();
        }

        let (_journal, entries) = Journal::open(&path).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[1],
            JournalEntry::Credited {
                validator_id: "v-1".to_string(),
                amount: 100
            }
        );
    }

    #[tokio::test]
    async fn test_torn_last_line_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        std::fs::write(
            &path,
            "{\"event\":\"credited\",\"validator_id\":\"v\",\"amount\":5}\n{\"event\":\"cred",
        )
        .unwrap();

        let (_journal, entries) = Journal::open(&path).await.unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_appends_after_torn_line_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        std::fs::write(
            &path,
            "{\"event\":\"credited\",\"validator_id\":\"v\",\"amount\":500}\n{\"event\":\"cred",
        )
        .unwrap();

        {
            let (journal, entries) = Journal::open(&path).await.unwrap();
            assert_eq!(entries.len(), 1);
            for _ in 0..2 {
                journal
                    .append(&JournalEntry::Credited {
                        validator_id: "v".to_string(),
                        amount: 100,
                    })
                    .await
                    .unwrap();
            }
        }

        let (_journal, entries) = Journal::open(&path).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[1],
            JournalEntry::Credited {
                validator_id: "v".to_string(),
                amount: 100
            }
        );
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("cred{"));
        assert_eq!(content.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_unterminated_last_record_is_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        std::fs::write(
            &path,
            "{\"event\":\"credited\",\"validator_id\":\"v\",\"amount\":5}",
        )
        .unwrap();

        {
            let (journal, entries) = Journal::open(&path).await.unwrap();
            assert_eq!(entries.len(), 1);
            journal
                .append(&JournalEntry::Credited {
                    validator_id: "v".to_string(),
                    amount: 7,
                })
                .await
                .unwrap();
        }

        let (_journal, entries) = Journal::open(&path).await.unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_middle_line_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        std::fs::write(
            &path,
            "garbage\n{\"event\":\"credited\",\"validator_id\":\"v\",\"amount\":5}\n",
        )
        .unwrap();

        let result = Journal::open(&path).await;
        assert!(matches!(result, Err(LedgerError::Corrupt { line: 1, .. })));
    }
}
