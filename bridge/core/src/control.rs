// Copyright (c) 2024 The Botho Foundation

//! Operator commands for a running listener.
//!
//! The checkpoint has a single writer, the scan engine. Operator tools never
//! touch the state file; they drop one JSON file per command into
//! `<state file>.commands/` and the engine applies them at the start of its
//! next cycle. A command file is removed only after the checkpoint holding
//! its effect has been flushed, so a crash in between replays it, and both
//! commands are harmless to replay.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, CheckpointError};
use crate::types::TxHash;

/// An operator action on a pending dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OperatorCommand {
    /// Reset the attempt budget and make the dispatch due now.
    Requeue { tx: TxHash },
    /// Drop the dispatch without relaying; its id becomes processed.
    Purge { tx: TxHash },
}

impl OperatorCommand {
    pub fn tx(&self) -> &TxHash {
        match self {
            OperatorCommand::Requeue { tx } | OperatorCommand::Purge { tx } => tx,
        }
    }
}

impl std::fmt::Display for OperatorCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatorCommand::Requeue { tx } => write!(f, "requeue {}", tx),
            OperatorCommand::Purge { tx } => write!(f, "purge {}", tx),
        }
    }
}

impl Checkpoint {
    /// Apply an operator command. Returns whether it changed anything.
    pub fn apply_command(&mut self, command: &OperatorCommand, now: DateTime<Utc>) -> bool {
        match command {
            OperatorCommand::Requeue { tx } => self.requeue(tx, now),
            OperatorCommand::Purge { tx } => self.purge(tx).is_some(),
        }
    }
}

/// Commands read from the queue, with the files to remove once applied.
#[derive(Debug, Default)]
pub struct QueuedCommands {
    pub commands: Vec<OperatorCommand>,
    files: Vec<PathBuf>,
}

impl QueuedCommands {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Directory of queued operator commands next to a state file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandQueue {
    dir: PathBuf,
}

impl CommandQueue {
    pub fn for_state_file(state_file: &Path) -> Self {
        let mut dir = state_file.as_os_str().to_owned();
        dir.push(".commands");
        Self {
            dir: PathBuf::from(dir),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queue `command`. The file appears under its final name only once
    /// fully written.
    pub fn submit(&self, command: &OperatorCommand) -> Result<PathBuf, CheckpointError> {
        let io_err = |source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        };
        fs::create_dir_all(&self.dir).map_err(io_err)?;

        let content = serde_json::to_string(command).map_err(CheckpointError::Encode)?;
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let stem = format!("{:020}-{}", nanos, std::process::id());
        let temp = self.dir.join(format!("{}.tmp", stem));
        let target = self.dir.join(format!("{}.json", stem));

        let mut file = File::create(&temp).map_err(io_err)?;
        file.write_all(content.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        fs::rename(&temp, &target).map_err(io_err)?;

        Ok(target)
    }

    /// Read every queued command in submission order. Unreadable command
    /// files are reported and scheduled for removal.
    pub fn read(&self) -> Result<QueuedCommands, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(QueuedCommands::default()),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut queued = QueuedCommands::default();
        for path in files {
            let parsed = fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|content| {
                    serde_json::from_str::<OperatorCommand>(&content).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(command) => queued.commands.push(command),
                Err(e) => warn!("Discarding unreadable command {}: {}", path.display(), e),
            }
            queued.files.push(path);
        }

        Ok(queued)
    }

    /// Remove command files whose effect has been persisted.
    pub fn acknowledge(&self, queued: QueuedCommands) {
        for path in queued.files {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove command {}: {}", path.display(), e);
                }
            }
        }
    }

    /// Apply every queued command to `checkpoint`. Returns the commands to
    /// acknowledge after the next flush.
    pub fn apply_to(
        &self,
        checkpoint: &mut Checkpoint,
        now: DateTime<Utc>,
    ) -> Result<QueuedCommands, CheckpointError> {
        let queued = self.read()?;
        for command in &queued.commands {
            if checkpoint.apply_command(command, now) {
                info!("Applied operator command: {}", command);
            } else {
                warn!(
                    "Operator command had no effect, {} is not pending: {}",
                    command.tx(),
                    command
                );
            }
        }
        Ok(queued)
    }
}
