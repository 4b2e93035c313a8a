//! Persistent, concurrent-safe storage of turns, tool usages, task configs,
//! and compact memories (spec §4.1 / §6).
//!
//! Backed by [`redb`], the closest embedded-transactional-store analog
//! available in this stack (there is no SQL engine dependency to build on).
//! Each logical index named in the external schema is realised as its own
//! redb table mapping a sortable composite key to a primary id; reads favor
//! `iter()` + filter over redb's range API so the access pattern stays
//! obviously correct by inspection.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use ambit_config::MemoryConfig;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};

use crate::retry::with_retry;
use crate::types::{
    CompactMemory, ConversationTurn, ExecutionStatus, StorageError, TaskConfig, ToolUsage,
    ToolUsagePatch, TurnPatch, TurnStatus,
};

const TURNS: TableDefinition<&str, &[u8]> = TableDefinition::new("turns");
const TURNS_BY_AGENT_NUM: TableDefinition<&str, &str> = TableDefinition::new("turns_by_agent_num");
const TURNS_BY_SESSION: TableDefinition<&str, &str> = TableDefinition::new("turns_by_session");
const TURNS_BY_TIME: TableDefinition<&str, &str> = TableDefinition::new("turns_by_time");

const TOOL_USAGE: TableDefinition<&str, &[u8]> = TableDefinition::new("tool_usage");
const TOOL_USAGE_BY_TURN: TableDefinition<&str, &str> = TableDefinition::new("tool_usage_by_turn");
const TOOL_USAGE_BY_AGENT: TableDefinition<&str, &str> =
    TableDefinition::new("tool_usage_by_agent");

const TASK_CONFIGS: TableDefinition<&str, &[u8]> = TableDefinition::new("task_configs");
const TASK_CONFIGS_BY_NAME: TableDefinition<&str, &str> =
    TableDefinition::new("task_configs_by_name");

const COMPACT_MEMORIES: TableDefinition<&str, &[u8]> = TableDefinition::new("compact_memories");

/// Report produced by [`MemoryStore::recover_abandoned`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryReport {
    pub turns_abandoned: usize,
    pub tool_usages_abandoned: usize,
}

pub struct MemoryStore {
    db: Database,
    config: MemoryConfig,
    /// Per-agent mutex guarding `next_turn_number` + the matching insert, so
    /// concurrent session starts for the same agent can't race past the
    /// `(agent_id, turn_number)` unique index (spec §5 / §9).
    turn_locks: Mutex<HashMap<String, std::sync::Arc<Mutex<()>>>>,
    /// Guards `recover_abandoned` so the sweep runs exactly once per process
    /// (spec §4.1: "runs exactly once at startup, under an initialization lock").
    recovered: Mutex<bool>,
}

fn agent_turn_key(agent_id: &str, turn_number: u64) -> String {
    format!("{agent_id}\u{0}{turn_number:020}")
}

fn time_key(dt: DateTime<Utc>, id: &str) -> String {
    let millis = dt.timestamp_millis().max(0) as u64;
    format!("{millis:020}\u{0}{id}")
}

fn session_key(session_id: &str, dt: DateTime<Utc>, id: &str) -> String {
    let millis = dt.timestamp_millis().max(0) as u64;
    format!("{session_id}\u{0}{millis:020}\u{0}{id}")
}

impl MemoryStore {
    pub fn open(config: &MemoryConfig) -> Result<Self, StorageError> {
        Self::open_at(Path::new(&config.db_path), config)
    }

    pub fn open_at(path: &Path, config: &MemoryConfig) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::Unknown(format!("creating db directory: {e}")))?;
        }
        let db = Database::create(path)?;
        {
            let tx = db.begin_write()?;
            tx.open_table(TURNS)?;
            tx.open_table(TURNS_BY_AGENT_NUM)?;
            tx.open_table(TURNS_BY_SESSION)?;
            tx.open_table(TURNS_BY_TIME)?;
            tx.open_table(TOOL_USAGE)?;
            tx.open_table(TOOL_USAGE_BY_TURN)?;
            tx.open_table(TOOL_USAGE_BY_AGENT)?;
            tx.open_table(TASK_CONFIGS)?;
            tx.open_table(TASK_CONFIGS_BY_NAME)?;
            tx.open_table(COMPACT_MEMORIES)?;
            tx.commit()?;
        }
        Ok(Self {
            db,
            config: config.clone(),
            turn_locks: Mutex::new(HashMap::new()),
            recovered: Mutex::new(false),
        })
    }

    fn agent_lock(&self, agent_id: &str) -> std::sync::Arc<Mutex<()>> {
        let mut locks = self.turn_locks.lock().unwrap();
        locks
            .entry(agent_id.to_string())
            .or_insert_with(|| std::sync::Arc::new(Mutex::new(())))
            .clone()
    }

    // ── turns ────────────────────────────────────────────────────────────────

    pub fn next_turn_number(&self, agent_id: &str) -> Result<u64, StorageError> {
        let lock = self.agent_lock(agent_id);
        let _guard = lock.lock().unwrap();
        self.next_turn_number_locked(agent_id)
    }

    fn next_turn_number_locked(&self, agent_id: &str) -> Result<u64, StorageError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(TURNS_BY_AGENT_NUM)?;
        let prefix = format!("{agent_id}\u{0}");
        let max = tbl
            .iter()?
            .filter_map(|r| r.ok())
            .filter(|(k, _)| k.value().starts_with(&prefix))
            .filter_map(|(k, _)| k.value()[prefix.len()..].parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Ok(max + 1)
    }

    /// Inserts a turn, assigning its `turn_number` atomically with respect to
    /// other callers for the same `agent_id`. Fails with `Integrity` if the
    /// turn already carries a `(agent_id, turn_number)` pair that exists.
    pub fn store_turn(&self, turn: ConversationTurn) -> Result<String, StorageError> {
        let lock = self.agent_lock(&turn.agent_id);
        let _guard = lock.lock().unwrap();

        with_retry(&self.config, || {
            let key = agent_turn_key(&turn.agent_id, turn.turn_number);
            let tx = self.db.begin_write()?;
            {
                let tbl = tx.open_table(TURNS_BY_AGENT_NUM)?;
                if tbl.get(key.as_str())?.is_some() {
                    return Err(StorageError::Integrity(format!(
                        "duplicate turn_number {} for agent {}",
                        turn.turn_number, turn.agent_id
                    )));
                }
            }
            let bytes = serde_json::to_vec(&turn)?;
            {
                let mut turns = tx.open_table(TURNS)?;
                turns.insert(turn.id.as_str(), bytes.as_slice())?;
            }
            {
                let mut by_num = tx.open_table(TURNS_BY_AGENT_NUM)?;
                by_num.insert(key.as_str(), turn.id.as_str())?;
            }
            {
                let mut by_session = tx.open_table(TURNS_BY_SESSION)?;
                by_session.insert(
                    session_key(&turn.session_id, turn.created_at, &turn.id).as_str(),
                    turn.id.as_str(),
                )?;
            }
            {
                let mut by_time = tx.open_table(TURNS_BY_TIME)?;
                by_time.insert(time_key(turn.created_at, &turn.id).as_str(), turn.id.as_str())?;
            }
            tx.commit()?;
            Ok(())
        })?;
        Ok(turn.id.clone())
    }

    pub fn update_turn(&self, id: &str, patch: &TurnPatch) -> Result<bool, StorageError> {
        with_retry(&self.config, || {
            let tx = self.db.begin_write()?;
            let changed;
            {
                let mut turns = tx.open_table(TURNS)?;
                match turns.get(id)?.map(|v| v.value().to_vec()) {
                    None => changed = false,
                    Some(bytes) => {
                        let mut turn: ConversationTurn = serde_json::from_slice(&bytes)?;
                        patch.apply(&mut turn);
                        let updated = serde_json::to_vec(&turn)?;
                        turns.insert(id, updated.as_slice())?;
                        changed = true;
                    }
                }
            }
            tx.commit()?;
            Ok(changed)
        })
    }

    pub fn get_turn(&self, id: &str) -> Result<Option<ConversationTurn>, StorageError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(TURNS)?;
        match tbl.get(id)? {
            None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        }
    }

    /// Newest-first by recorded timestamp.
    pub fn get_turns_by_session(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationTurn>, StorageError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(TURNS_BY_SESSION)?;
        let prefix = format!("{session_id}\u{0}");
        let mut ids: Vec<String> = tbl
            .iter()?
            .filter_map(|r| r.ok())
            .filter(|(k, _)| k.value().starts_with(&prefix))
            .map(|(_, v)| v.value().to_string())
            .collect();
        ids.reverse(); // newest-first
        if let Some(limit) = limit {
            ids.truncate(limit);
        }
        self.hydrate_turns(&tx, &ids)
    }

    /// Oldest-first by `turn_number`.
    pub fn get_turns_by_agent(
        &self,
        agent_id: &str,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<ConversationTurn>, StorageError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(TURNS_BY_AGENT_NUM)?;
        let prefix = format!("{agent_id}\u{0}");
        let ids: Vec<String> = tbl
            .iter()?
            .filter_map(|r| r.ok())
            .filter(|(k, _)| k.value().starts_with(&prefix))
            .map(|(_, v)| v.value().to_string())
            .skip(offset.unwrap_or(0))
            .collect();
        let ids: Vec<String> = match limit {
            Some(limit) => ids.into_iter().take(limit).collect(),
            None => ids,
        };
        self.hydrate_turns(&tx, &ids)
    }

    /// Newest-first within `[start, end]` (either bound optional).
    pub fn get_turns_by_timerange(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<ConversationTurn>, StorageError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(TURNS_BY_TIME)?;
        let mut ids: Vec<(u64, String)> = tbl
            .iter()?
            .filter_map(|r| r.ok())
            .filter_map(|(k, v)| {
                let key = k.value();
                let millis: u64 = key.split('\u{0}').next()?.parse().ok()?;
                Some((millis, v.value().to_string()))
            })
            .filter(|(millis, _)| {
                let after_start = start
                    .map(|s| *millis as i64 >= s.timestamp_millis())
                    .unwrap_or(true);
                let before_end = end
                    .map(|e| *millis as i64 <= e.timestamp_millis())
                    .unwrap_or(true);
                after_start && before_end
            })
            .collect();
        ids.reverse(); // newest-first
        let ids: Vec<String> = ids
            .into_iter()
            .map(|(_, id)| id)
            .skip(offset.unwrap_or(0))
            .collect();
        let ids: Vec<String> = match limit {
            Some(limit) => ids.into_iter().take(limit).collect(),
            None => ids,
        };
        self.hydrate_turns(&tx, &ids)
    }

    fn hydrate_turns(
        &self,
        tx: &redb::ReadTransaction,
        ids: &[String],
    ) -> Result<Vec<ConversationTurn>, StorageError> {
        let tbl = tx.open_table(TURNS)?;
        ids.iter()
            .filter_map(|id| tbl.get(id.as_str()).transpose())
            .map(|r| {
                let v = r?;
                Ok(serde_json::from_slice(v.value())?)
            })
            .collect()
    }

    pub fn mark_turns_compacted(&self, ids: &[String]) -> Result<usize, StorageError> {
        let mut count = 0;
        for id in ids {
            if self.update_turn(
                id,
                &TurnPatch {
                    compacted: Some(true),
                    ..Default::default()
                },
            )? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Uncompacted turns, oldest-first. `token_limit`, if given, caps the
    /// returned set so the sum of each turn's associated tool-usage
    /// `tokens_used` stays at or under the limit.
    pub fn get_uncompacted_turns(
        &self,
        token_limit: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<ConversationTurn>, StorageError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(TURNS_BY_TIME)?;
        let ids: Vec<String> = tbl
            .iter()?
            .filter_map(|r| r.ok())
            .map(|(_, v)| v.value().to_string())
            .collect();
        let turns = self.hydrate_turns(&tx, &ids)?;
        let mut out = Vec::new();
        let mut token_total = 0u64;
        for turn in turns.into_iter().filter(|t| !t.compacted) {
            if let Some(cap) = limit {
                if out.len() >= cap {
                    break;
                }
            }
            if let Some(cap) = token_limit {
                let turn_tokens: u64 = self
                    .get_tool_usage_by_turn(&turn.id)?
                    .iter()
                    .filter_map(|u| u.tokens_used)
                    .sum();
                if token_total + turn_tokens > cap && !out.is_empty() {
                    break;
                }
                token_total += turn_tokens;
            }
            out.push(turn);
        }
        Ok(out)
    }

    // ── tool usage ───────────────────────────────────────────────────────────

    pub fn store_tool_usage(&self, usage: ToolUsage) -> Result<String, StorageError> {
        with_retry(&self.config, || {
            let tx = self.db.begin_write()?;
            let bytes = serde_json::to_vec(&usage)?;
            {
                let mut tbl = tx.open_table(TOOL_USAGE)?;
                tbl.insert(usage.id.as_str(), bytes.as_slice())?;
            }
            {
                let mut by_turn = tx.open_table(TOOL_USAGE_BY_TURN)?;
                by_turn.insert(
                    format!("{}\u{0}{}", usage.turn_id, usage.id).as_str(),
                    usage.id.as_str(),
                )?;
            }
            {
                let mut by_agent = tx.open_table(TOOL_USAGE_BY_AGENT)?;
                by_agent.insert(
                    format!("{}\u{0}{}", usage.agent_id, usage.id).as_str(),
                    usage.id.as_str(),
                )?;
            }
            tx.commit()?;
            Ok(())
        })?;
        Ok(usage.id.clone())
    }

    pub fn update_tool_usage(
        &self,
        id: &str,
        patch: &ToolUsagePatch,
    ) -> Result<bool, StorageError> {
        with_retry(&self.config, || {
            let tx = self.db.begin_write()?;
            let changed;
            {
                let mut tbl = tx.open_table(TOOL_USAGE)?;
                match tbl.get(id)?.map(|v| v.value().to_vec()) {
                    None => changed = false,
                    Some(bytes) => {
                        let mut usage: ToolUsage = serde_json::from_slice(&bytes)?;
                        patch.apply(&mut usage);
                        let updated = serde_json::to_vec(&usage)?;
                        tbl.insert(id, updated.as_slice())?;
                        changed = true;
                    }
                }
            }
            tx.commit()?;
            Ok(changed)
        })
    }

    pub fn get_tool_usage(&self, id: &str) -> Result<Option<ToolUsage>, StorageError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(TOOL_USAGE)?;
        match tbl.get(id)? {
            None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        }
    }

    pub fn get_tool_usage_by_turn(&self, turn_id: &str) -> Result<Vec<ToolUsage>, StorageError> {
        let tx = self.db.begin_read()?;
        let idx = tx.open_table(TOOL_USAGE_BY_TURN)?;
        let prefix = format!("{turn_id}\u{0}");
        let ids: Vec<String> = idx
            .iter()?
            .filter_map(|r| r.ok())
            .filter(|(k, _)| k.value().starts_with(&prefix))
            .map(|(_, v)| v.value().to_string())
            .collect();
        let tbl = tx.open_table(TOOL_USAGE)?;
        ids.iter()
            .filter_map(|id| tbl.get(id.as_str()).transpose())
            .map(|r| Ok(serde_json::from_slice(r?.value())?))
            .collect()
    }

    pub fn get_tool_usage_by_agent(
        &self,
        agent_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ToolUsage>, StorageError> {
        let tx = self.db.begin_read()?;
        let idx = tx.open_table(TOOL_USAGE_BY_AGENT)?;
        let prefix = format!("{agent_id}\u{0}");
        let mut ids: Vec<String> = idx
            .iter()?
            .filter_map(|r| r.ok())
            .filter(|(k, _)| k.value().starts_with(&prefix))
            .map(|(_, v)| v.value().to_string())
            .collect();
        if let Some(limit) = limit {
            ids.truncate(limit);
        }
        let tbl = tx.open_table(TOOL_USAGE)?;
        ids.iter()
            .filter_map(|id| tbl.get(id.as_str()).transpose())
            .map(|r| Ok(serde_json::from_slice(r?.value())?))
            .collect()
    }

    // ── task configs ─────────────────────────────────────────────────────────

    pub fn store_task_config(&self, config: TaskConfig) -> Result<String, StorageError> {
        with_retry(&self.config, || {
            let tx = self.db.begin_write()?;
            let bytes = serde_json::to_vec(&config)?;
            {
                let mut tbl = tx.open_table(TASK_CONFIGS)?;
                tbl.insert(config.id.as_str(), bytes.as_slice())?;
            }
            {
                let mut by_name = tx.open_table(TASK_CONFIGS_BY_NAME)?;
                by_name.insert(config.name.as_str(), config.id.as_str())?;
            }
            tx.commit()?;
            Ok(())
        })?;
        Ok(config.id.clone())
    }

    pub fn get_task_config(&self, id: &str) -> Result<Option<TaskConfig>, StorageError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(TASK_CONFIGS)?;
        match tbl.get(id)? {
            None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        }
    }

    pub fn get_task_config_by_name(&self, name: &str) -> Result<Option<TaskConfig>, StorageError> {
        let tx = self.db.begin_read()?;
        let by_name = tx.open_table(TASK_CONFIGS_BY_NAME)?;
        let Some(id) = by_name.get(name)?.map(|v| v.value().to_string()) else {
            return Ok(None);
        };
        let tbl = tx.open_table(TASK_CONFIGS)?;
        match tbl.get(id.as_str())? {
            None => Ok(None),
            Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
        }
    }

    pub fn list_task_configs(&self) -> Result<Vec<TaskConfig>, StorageError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(TASK_CONFIGS)?;
        tbl.iter()?
            .filter_map(|r| r.ok())
            .map(|(_, v)| Ok(serde_json::from_slice(v.value())?))
            .collect()
    }

    // ── compact memories ─────────────────────────────────────────────────────

    pub fn store_compact_memory(&self, mem: CompactMemory) -> Result<String, StorageError> {
        with_retry(&self.config, || {
            let tx = self.db.begin_write()?;
            let bytes = serde_json::to_vec(&mem)?;
            {
                let mut tbl = tx.open_table(COMPACT_MEMORIES)?;
                tbl.insert(mem.id.as_str(), bytes.as_slice())?;
            }
            tx.commit()?;
            Ok(())
        })?;
        Ok(mem.id.clone())
    }

    pub fn get_compact_memories(
        &self,
        processed: Option<bool>,
    ) -> Result<Vec<CompactMemory>, StorageError> {
        let tx = self.db.begin_read()?;
        let tbl = tx.open_table(COMPACT_MEMORIES)?;
        tbl.iter()?
            .filter_map(|r| r.ok())
            .map(|(_, v)| -> Result<CompactMemory, StorageError> {
                Ok(serde_json::from_slice(v.value())?)
            })
            .filter(|r| match (r, processed) {
                (Ok(m), Some(p)) => m.processed == p,
                _ => true,
            })
            .collect()
    }

    // ── recovery ─────────────────────────────────────────────────────────────

    /// Runs the crash-recovery sweep exactly once per process (spec §4.1).
    /// Idempotent: a second call is a no-op that returns a zeroed report.
    pub fn recover_abandoned(&self) -> Result<RecoveryReport, StorageError> {
        let mut guard = self.recovered.lock().unwrap();
        if *guard {
            return Ok(RecoveryReport::default());
        }

        let report = self.run_recovery_sweep();
        match &report {
            Ok(_) => *guard = true,
            Err(e) => {
                // Failure of recovery is logged but does not block startup.
                tracing::error!(error = %e, "recovery sweep failed; continuing startup");
                *guard = true;
            }
        }
        report.or_else(|_| Ok(RecoveryReport::default()))
    }

    fn run_recovery_sweep(&self) -> Result<RecoveryReport, StorageError> {
        let tx = self.db.begin_write()?;
        let mut turns_abandoned = 0;
        {
            let mut tbl = tx.open_table(TURNS)?;
            let ids: Vec<String> = tbl
                .iter()?
                .filter_map(|r| r.ok())
                .map(|(k, _)| k.value().to_string())
                .collect();
            for id in ids {
                let Some(bytes) = tbl.get(id.as_str())?.map(|v| v.value().to_vec()) else {
                    continue;
                };
                let mut turn: ConversationTurn = serde_json::from_slice(&bytes)?;
                if turn.status == TurnStatus::InProgress {
                    turn.status = TurnStatus::Abandoned;
                    turn.error_details = Some(serde_json::json!({
                        "error": "Conversation was abandoned (system shutdown)"
                    }));
                    turn.updated_at = Utc::now();
                    tbl.insert(id.as_str(), serde_json::to_vec(&turn)?.as_slice())?;
                    turns_abandoned += 1;
                }
            }
        }
        let mut tool_usages_abandoned = 0;
        {
            let mut tbl = tx.open_table(TOOL_USAGE)?;
            let ids: Vec<String> = tbl
                .iter()?
                .filter_map(|r| r.ok())
                .map(|(k, _)| k.value().to_string())
                .collect();
            for id in ids {
                let Some(bytes) = tbl.get(id.as_str())?.map(|v| v.value().to_vec()) else {
                    continue;
                };
                let mut usage: ToolUsage = serde_json::from_slice(&bytes)?;
                if usage.execution_status.is_in_flight() {
                    usage.execution_status = ExecutionStatus::Abandoned;
                    usage.execution_error =
                        Some("Tool execution was abandoned (system shutdown)".to_string());
                    usage.execution_completed_at = Some(Utc::now());
                    tbl.insert(id.as_str(), serde_json::to_vec(&usage)?.as_slice())?;
                    tool_usages_abandoned += 1;
                }
            }
        }
        tx.commit()?;
        Ok(RecoveryReport {
            turns_abandoned,
            tool_usages_abandoned,
        })
    }

    /// Final checkpoint and connection release. Consumes the store since
    /// redb has nothing meaningful left to do with it afterward.
    pub fn close(self) -> Result<(), StorageError> {
        drop(self.db);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConversationType, TaskDefinition};

    fn test_store() -> (MemoryStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = MemoryConfig {
            db_path: dir.path().join("store.redb").to_string_lossy().to_string(),
            ..Default::default()
        };
        let store = MemoryStore::open(&config).unwrap();
        (store, dir)
    }

    fn turn(agent: &str, session: &str, n: u64) -> ConversationTurn {
        ConversationTurn::new_in_progress(
            agent,
            session,
            n,
            "user",
            agent,
            ConversationType::UserAgent,
            "hello",
            None,
        )
    }

    #[test]
    fn store_and_get_turn_round_trips() {
        let (store, _dir) = test_store();
        let t = turn("agentA", "sessA", 1);
        let id = store.store_turn(t.clone()).unwrap();
        let fetched = store.get_turn(&id).unwrap().unwrap();
        assert_eq!(fetched.user_query, "hello");
        assert_eq!(fetched.turn_number, 1);
    }

    #[test]
    fn duplicate_turn_number_for_same_agent_is_integrity_error() {
        let (store, _dir) = test_store();
        store.store_turn(turn("agentA", "sessA", 1)).unwrap();
        let err = store.store_turn(turn("agentA", "sessB", 1)).unwrap_err();
        assert_eq!(err.kind(), crate::types::StorageErrorKind::Integrity);
    }

    #[test]
    fn next_turn_number_increments_per_agent() {
        let (store, _dir) = test_store();
        assert_eq!(store.next_turn_number("agentA").unwrap(), 1);
        store.store_turn(turn("agentA", "sessA", 1)).unwrap();
        assert_eq!(store.next_turn_number("agentA").unwrap(), 2);
        // Independent counter per agent.
        assert_eq!(store.next_turn_number("agentB").unwrap(), 1);
    }

    #[test]
    fn get_turns_by_agent_is_oldest_first() {
        let (store, _dir) = test_store();
        store.store_turn(turn("agentA", "sessA", 1)).unwrap();
        store.store_turn(turn("agentA", "sessA", 2)).unwrap();
        store.store_turn(turn("agentA", "sessA", 3)).unwrap();
        let turns = store.get_turns_by_agent("agentA", None, None).unwrap();
        let nums: Vec<u64> = turns.iter().map(|t| t.turn_number).collect();
        assert_eq!(nums, vec![1, 2, 3]);
    }

    #[test]
    fn get_turns_by_session_filters_by_true_session_not_agent() {
        // Regression test for the documented source bug (spec §9): must
        // filter by session_id, not agent_id.
        let (store, _dir) = test_store();
        store.store_turn(turn("agentA", "sessA", 1)).unwrap();
        store.store_turn(turn("agentA", "sessB", 2)).unwrap();
        let turns = store.get_turns_by_session("sessA", None).unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].session_id, "sessA");
    }

    #[test]
    fn update_turn_returns_false_for_unknown_id() {
        let (store, _dir) = test_store();
        let changed = store
            .update_turn("does-not-exist", &TurnPatch::default())
            .unwrap();
        assert!(!changed);
    }

    #[test]
    fn update_turn_applies_patch() {
        let (store, _dir) = test_store();
        let id = store.store_turn(turn("agentA", "sessA", 1)).unwrap();
        let changed = store
            .update_turn(
                &id,
                &TurnPatch {
                    status: Some(TurnStatus::Completed),
                    agent_response: Some("done".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(changed);
        let fetched = store.get_turn(&id).unwrap().unwrap();
        assert_eq!(fetched.status, TurnStatus::Completed);
        assert_eq!(fetched.agent_response.as_deref(), Some("done"));
    }

    #[test]
    fn recover_abandoned_rewrites_in_progress_turns_and_tool_usage() {
        let (store, _dir) = test_store();
        let id = store.store_turn(turn("agentA", "sessA", 1)).unwrap();
        let usage = ToolUsage::new(&id, "agentA", "search", serde_json::json!({}), None, false);
        let usage_id = store.store_tool_usage(usage).unwrap();

        let report = store.recover_abandoned().unwrap();
        assert_eq!(report.turns_abandoned, 1);
        assert_eq!(report.tool_usages_abandoned, 1);

        let turn = store.get_turn(&id).unwrap().unwrap();
        assert_eq!(turn.status, TurnStatus::Abandoned);
        assert_eq!(
            turn.error_details.unwrap()["error"],
            "Conversation was abandoned (system shutdown)"
        );

        let usage = store.get_tool_usage(&usage_id).unwrap().unwrap();
        assert_eq!(usage.execution_status, ExecutionStatus::Abandoned);
    }

    #[test]
    fn recover_abandoned_is_idempotent() {
        let (store, _dir) = test_store();
        store.store_turn(turn("agentA", "sessA", 1)).unwrap();
        let first = store.recover_abandoned().unwrap();
        assert_eq!(first.turns_abandoned, 1);
        let second = store.recover_abandoned().unwrap();
        assert_eq!(second.turns_abandoned, 0);
    }

    #[test]
    fn task_config_round_trips_by_id_and_name() {
        let (store, _dir) = test_store();
        let def = TaskDefinition {
            name: "Echo".to_string(),
            description: "echoes".to_string(),
            instructions: "Echo {message}".to_string(),
            input_schema: vec![],
            output_schema: vec![],
            task_type: "generic".to_string(),
        };
        let config = TaskConfig::new(def);
        let id = store.store_task_config(config).unwrap();

        let by_id = store.get_task_config(&id).unwrap().unwrap();
        assert_eq!(by_id.name, "Echo");
        let by_name = store.get_task_config_by_name("Echo").unwrap().unwrap();
        assert_eq!(by_name.id, id);
    }

    #[test]
    fn unknown_ids_return_none_not_error() {
        let (store, _dir) = test_store();
        assert!(store.get_turn("nope").unwrap().is_none());
        assert!(store.get_tool_usage("nope").unwrap().is_none());
        assert!(store.get_task_config("nope").unwrap().is_none());
    }

    #[test]
    fn mark_turns_compacted_flips_flag() {
        let (store, _dir) = test_store();
        let id = store.store_turn(turn("agentA", "sessA", 1)).unwrap();
        let n = store.mark_turns_compacted(&[id.clone()]).unwrap();
        assert_eq!(n, 1);
        assert!(store.get_turn(&id).unwrap().unwrap().compacted);
    }

    #[test]
    fn get_uncompacted_turns_excludes_compacted() {
        let (store, _dir) = test_store();
        let a = store.store_turn(turn("agentA", "sessA", 1)).unwrap();
        let _b = store.store_turn(turn("agentA", "sessA", 2)).unwrap();
        store.mark_turns_compacted(&[a]).unwrap();
        let uncompacted = store.get_uncompacted_turns(None, None).unwrap();
        assert_eq!(uncompacted.len(), 1);
        assert_eq!(uncompacted[0].turn_number, 2);
    }
}
