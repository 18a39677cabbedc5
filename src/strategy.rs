//! Recurring transfer strategies and the tick state machine.
//!
//! A strategy is created disabled, armed by `start` (which schedules the
//! first run immediately), and advanced by `tick`. One tick emits at most
//! one transfer; missed intervals after downtime collapse into a single
//! jump of `next_run_at` to the first boundary in the future, so a restart
//! can never fire a burst that retroactively violates the daily cap.
//!
//! A strategy update and its run record commit together: both live in one
//! store file and one atomic replacement writes them, so a crash leaves
//! either the pre-tick state or the post-tick state, never half of one.

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::chain::ChainOps;
use crate::config::SecretString;
use crate::error::CoreError;
use crate::store::{self, StoreError};
use crate::timestamp::{UnixTimestamp, UtcDay};
use crate::units::NativeAmount;
use crate::wallet::{TransferOutcome, WalletManager};

/// What a strategy does when due. One variant today; the tag keeps the
/// store format open for other shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RecurringTransfer,
}

/// One persistent strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub label: String,
    pub agent_id: String,
    pub kind: StrategyKind,
    pub to_address: Address,
    pub amount: NativeAmount,
    pub interval_seconds: u64,
    pub enabled: bool,
    /// Skip runs while the chain's base fee exceeds this many gwei.
    pub max_base_fee_gwei: Option<u64>,
    /// Ceiling on the total sent per UTC day.
    pub daily_cap: Option<NativeAmount>,
    pub next_run_at: Option<UnixTimestamp>,
    pub last_run_at: Option<UnixTimestamp>,
    pub last_tx_hash: Option<B256>,
    pub spent_day: Option<UtcDay>,
    pub spent_today: NativeAmount,
    pub created_at: UnixTimestamp,
    pub updated_at: UnixTimestamp,
}

/// Terminal classification of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Sent,
    SkippedGas,
    SkippedCap,
    SkippedNotDue,
    SkippedSimulation,
    Failed,
}

/// Append-only audit child of a strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub strategy_label: String,
    pub ran_at: UnixTimestamp,
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,
    pub detail: String,
}

/// What `tick` reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickResult {
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<B256>,
    pub next_run_at: Option<UnixTimestamp>,
}

/// Inputs for `create_strategy`.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateStrategyParams {
    pub label: String,
    pub agent_id: String,
    pub to_address: String,
    pub amount: NativeAmount,
    pub interval_seconds: u64,
    #[serde(default)]
    pub max_base_fee_gwei: Option<u64>,
    #[serde(default)]
    pub daily_cap: Option<NativeAmount>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StrategiesFile {
    strategies: BTreeMap<String, StrategyRecord>,
    runs: Vec<RunRecord>,
}

/// Name of the strategies store under the data dir.
const STRATEGIES_FILE: &str = "strategies.json";

/// Owns strategy and run records; drives transfers through the wallet.
pub struct StrategyManager {
    wallet: Arc<WalletManager>,
    chain: Arc<dyn ChainOps>,
    path: PathBuf,
    /// Confirmation material handed to the wallet on every strategy
    /// transfer; the wallet only checks it above the spend threshold.
    confirmation_code: Option<SecretString>,
    inner: Mutex<StrategiesFile>,
    /// One token per label so a manual tick and the scheduler cannot both
    /// advance the same strategy. Held across the tick's chain calls;
    /// unrelated strategies stay unblocked.
    tick_tokens: dashmap::DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl StrategyManager {
    pub fn open(
        data_dir: &Path,
        wallet: Arc<WalletManager>,
        chain: Arc<dyn ChainOps>,
        confirmation_code: Option<SecretString>,
    ) -> Result<Self, StoreError> {
        let path = data_dir.join(STRATEGIES_FILE);
        let file = store::load::<StrategiesFile>(&path)?.unwrap_or_default();
        tracing::info!(
            strategies = file.strategies.len(),
            runs = file.runs.len(),
            path = %path.display(),
            "strategy store opened"
        );
        Ok(Self {
            wallet,
            chain,
            path,
            confirmation_code,
            inner: Mutex::new(file),
            tick_tokens: dashmap::DashMap::new(),
        })
    }

    /// Creates a strategy in the disabled state.
    pub fn create(&self, params: CreateStrategyParams) -> Result<StrategyRecord, CoreError> {
        if params.interval_seconds == 0 {
            return Err(CoreError::InvalidParams(
                "interval_seconds must be at least 1".into(),
            ));
        }
        if params.amount.is_zero() {
            return Err(CoreError::InvalidParams("amount must be positive".into()));
        }
        let to_address = crate::wallet::parse_address(&params.to_address)?;
        // The agent must already hold a wallet.
        self.wallet.keystore().get(&params.agent_id)?;

        let now = UnixTimestamp::try_now().map_err(|e| CoreError::Storage(e.to_string()))?;
        let record = StrategyRecord {
            label: params.label.clone(),
            agent_id: params.agent_id,
            kind: StrategyKind::RecurringTransfer,
            to_address,
            amount: params.amount,
            interval_seconds: params.interval_seconds,
            enabled: false,
            max_base_fee_gwei: params.max_base_fee_gwei,
            daily_cap: params.daily_cap,
            next_run_at: None,
            last_run_at: None,
            last_tx_hash: None,
            spent_day: None,
            spent_today: NativeAmount::ZERO,
            created_at: now,
            updated_at: now,
        };

        let mut inner = self.inner.lock().expect("strategy lock poisoned");
        if inner.strategies.contains_key(&params.label) {
            return Err(CoreError::StrategyBadState {
                label: params.label,
                detail: "label already exists".into(),
            });
        }
        inner.strategies.insert(params.label.clone(), record.clone());
        if let Err(e) = store::save(&self.path, &*inner) {
            inner.strategies.remove(&params.label);
            return Err(CoreError::Storage(e.to_string()));
        }
        tracing::info!(label = %record.label, agent_id = %record.agent_id, "strategy created");
        Ok(record)
    }

    /// Arms a created or stopped strategy; the first run is due
    /// immediately.
    pub fn start(&self, label: &str, now: UnixTimestamp) -> Result<StrategyRecord, CoreError> {
        self.update_record(label, |strategy| {
            if strategy.enabled {
                return Err(CoreError::StrategyBadState {
                    label: strategy.label.clone(),
                    detail: "already enabled".into(),
                });
            }
            strategy.enabled = true;
            strategy.next_run_at = Some(now);
            strategy.updated_at = now;
            Ok(())
        })
    }

    /// Disarms an enabled strategy.
    pub fn stop(&self, label: &str, now: UnixTimestamp) -> Result<StrategyRecord, CoreError> {
        self.update_record(label, |strategy| {
            if !strategy.enabled {
                return Err(CoreError::StrategyBadState {
                    label: strategy.label.clone(),
                    detail: "not enabled".into(),
                });
            }
            strategy.enabled = false;
            strategy.next_run_at = None;
            strategy.updated_at = now;
            Ok(())
        })
    }

    /// Removes the strategy record. Run records stay: they are audit.
    pub fn delete(&self, label: &str) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().expect("strategy lock poisoned");
        let removed = inner
            .strategies
            .remove(label)
            .ok_or_else(|| CoreError::StrategyNotFound(label.to_string()))?;
        if let Err(e) = store::save(&self.path, &*inner) {
            inner.strategies.insert(label.to_string(), removed);
            return Err(CoreError::Storage(e.to_string()));
        }
        tracing::info!(label, "strategy deleted");
        Ok(())
    }

    pub fn get(&self, label: &str) -> Result<StrategyRecord, CoreError> {
        self.inner
            .lock()
            .expect("strategy lock poisoned")
            .strategies
            .get(label)
            .cloned()
            .ok_or_else(|| CoreError::StrategyNotFound(label.to_string()))
    }

    pub fn list(&self) -> Vec<StrategyRecord> {
        self.inner
            .lock()
            .expect("strategy lock poisoned")
            .strategies
            .values()
            .cloned()
            .collect()
    }

    /// Most recent runs for one strategy, newest first.
    pub fn recent_runs(&self, label: &str, limit: usize) -> Vec<RunRecord> {
        self.inner
            .lock()
            .expect("strategy lock poisoned")
            .runs
            .iter()
            .rev()
            .filter(|run| run.strategy_label == label)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Advances one strategy by at most one transfer.
    ///
    /// Gate order: due-time, daily cap (after the UTC day rollover reset),
    /// base-fee ceiling, balance simulation, then the transfer itself.
    /// Every gated skip records a run and pushes `next_run_at` to the next
    /// future boundary; a not-due tick changes nothing at all.
    pub async fn tick(&self, label: &str, now: UnixTimestamp) -> Result<TickResult, CoreError> {
        let token = self.tick_token(label);
        let _guard = token.lock().await;

        let mut strategy = self.get(label)?;
        if !strategy.enabled {
            return Ok(TickResult {
                outcome: RunOutcome::SkippedNotDue,
                tx_hash: None,
                next_run_at: strategy.next_run_at,
            });
        }
        let next_run_at = match strategy.next_run_at {
            Some(next) if now >= next => next,
            other => {
                return Ok(TickResult {
                    outcome: RunOutcome::SkippedNotDue,
                    tx_hash: None,
                    next_run_at: other,
                });
            }
        };

        let today = now.utc_day();
        if strategy.spent_day != Some(today) {
            strategy.spent_day = Some(today);
            strategy.spent_today = NativeAmount::ZERO;
        }

        if let Some(cap) = strategy.daily_cap {
            let would_spend = strategy.spent_today.saturating_add(strategy.amount);
            if would_spend > cap {
                let spent = strategy.spent_today;
                return self.finish_skip(
                    strategy,
                    now,
                    next_run_at,
                    RunOutcome::SkippedCap,
                    format!("daily cap {cap} reached, spent {spent} today"),
                );
            }
        }

        if let Some(max_gwei) = strategy.max_base_fee_gwei {
            let status = self.chain.connected().await?;
            let ceiling_wei = u128::from(max_gwei) * 1_000_000_000;
            if status.base_fee_per_gas > ceiling_wei {
                return self.finish_skip(
                    strategy,
                    now,
                    next_run_at,
                    RunOutcome::SkippedGas,
                    format!(
                        "base fee {} wei above ceiling {max_gwei} gwei",
                        status.base_fee_per_gas
                    ),
                );
            }
        }

        let destination = strategy.to_address.to_string();
        let simulation = self
            .wallet
            .simulate_transfer(&strategy.agent_id, &destination, strategy.amount)
            .await?;
        if !simulation.sufficient_balance {
            return self.finish_skip(
                strategy,
                now,
                next_run_at,
                RunOutcome::SkippedSimulation,
                format!(
                    "needs {}, balance {}",
                    simulation.total_native, simulation.balance
                ),
            );
        }

        let transfer = self
            .wallet
            .execute_transfer(
                &strategy.agent_id,
                &destination,
                strategy.amount,
                self.confirmation_code.as_ref().map(|c| c.expose()),
                false,
            )
            .await;

        match transfer {
            Ok(TransferOutcome::Sent { tx_hash, .. }) => {
                strategy.last_run_at = Some(now);
                strategy.last_tx_hash = Some(tx_hash);
                strategy.spent_today = strategy.spent_today.saturating_add(strategy.amount);
                let next = advance_schedule(next_run_at, strategy.interval_seconds, now);
                strategy.next_run_at = Some(next);
                strategy.updated_at = now;
                let run = RunRecord {
                    strategy_label: strategy.label.clone(),
                    ran_at: now,
                    outcome: RunOutcome::Sent,
                    tx_hash: Some(tx_hash),
                    detail: format!("sent {} to {destination}", strategy.amount),
                };
                self.commit(strategy, run)?;
                Ok(TickResult {
                    outcome: RunOutcome::Sent,
                    tx_hash: Some(tx_hash),
                    next_run_at: Some(next),
                })
            }
            Ok(TransferOutcome::DryRun(_)) => unreachable!("tick never requests a dry run"),
            Err(e) => {
                let next = advance_schedule(next_run_at, strategy.interval_seconds, now);
                strategy.next_run_at = Some(next);
                strategy.updated_at = now;
                let run = RunRecord {
                    strategy_label: strategy.label.clone(),
                    ran_at: now,
                    outcome: RunOutcome::Failed,
                    tx_hash: None,
                    detail: e.kind().to_string(),
                };
                self.commit(strategy, run)?;
                Err(e)
            }
        }
    }

    /// Ticks every due strategy until cancelled. One structured line per
    /// run outcome; errors are logged and the loop keeps going.
    pub async fn run_scheduler(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval = ?interval, "strategy scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("strategy scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }
            let now = match UnixTimestamp::try_now() {
                Ok(now) => now,
                Err(e) => {
                    tracing::error!(error = %e, "system clock unavailable, skipping pass");
                    continue;
                }
            };
            let due: Vec<String> = {
                let inner = self.inner.lock().expect("strategy lock poisoned");
                inner
                    .strategies
                    .values()
                    .filter(|s| s.enabled && s.next_run_at.is_some_and(|next| now >= next))
                    .map(|s| s.label.clone())
                    .collect()
            };
            for label in due {
                match self.tick(&label, now).await {
                    Ok(result) => {
                        tracing::info!(label = %label, outcome = ?result.outcome, tx_hash = ?result.tx_hash, "strategy ticked");
                    }
                    Err(e) => {
                        tracing::warn!(label = %label, kind = e.kind(), error = %e, "strategy tick failed");
                    }
                }
            }
        }
    }

    fn finish_skip(
        &self,
        mut strategy: StrategyRecord,
        now: UnixTimestamp,
        next_run_at: UnixTimestamp,
        outcome: RunOutcome,
        detail: String,
    ) -> Result<TickResult, CoreError> {
        let next = advance_schedule(next_run_at, strategy.interval_seconds, now);
        strategy.next_run_at = Some(next);
        strategy.updated_at = now;
        let run = RunRecord {
            strategy_label: strategy.label.clone(),
            ran_at: now,
            outcome,
            tx_hash: None,
            detail,
        };
        self.commit(strategy, run)?;
        Ok(TickResult {
            outcome,
            tx_hash: None,
            next_run_at: Some(next),
        })
    }

    /// Persists a strategy update and its run record as one atomic write.
    fn commit(&self, strategy: StrategyRecord, run: RunRecord) -> Result<(), CoreError> {
        let mut inner = self.inner.lock().expect("strategy lock poisoned");
        let label = strategy.label.clone();
        let previous = inner.strategies.insert(label.clone(), strategy);
        inner.runs.push(run);
        if let Err(e) = store::save(&self.path, &*inner) {
            inner.runs.pop();
            match previous {
                Some(previous) => inner.strategies.insert(label, previous),
                None => inner.strategies.remove(&label),
            };
            return Err(CoreError::Storage(e.to_string()));
        }
        Ok(())
    }

    fn update_record(
        &self,
        label: &str,
        mutate: impl FnOnce(&mut StrategyRecord) -> Result<(), CoreError>,
    ) -> Result<StrategyRecord, CoreError> {
        let mut inner = self.inner.lock().expect("strategy lock poisoned");
        let strategy = inner
            .strategies
            .get_mut(label)
            .ok_or_else(|| CoreError::StrategyNotFound(label.to_string()))?;
        let previous = strategy.clone();
        mutate(strategy)?;
        let updated = strategy.clone();
        if let Err(e) = store::save(&self.path, &*inner) {
            inner.strategies.insert(label.to_string(), previous);
            return Err(CoreError::Storage(e.to_string()));
        }
        Ok(updated)
    }

    fn tick_token(&self, label: &str) -> Arc<tokio::sync::Mutex<()>> {
        let entry = self
            .tick_tokens
            .entry(label.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())));
        Arc::clone(entry.value())
    }
}

/// The smallest schedule boundary strictly after `now`.
///
/// Always at least one interval past the boundary that fired; downtime of
/// many intervals collapses into one jump.
fn advance_schedule(fired: UnixTimestamp, interval_seconds: u64, now: UnixTimestamp) -> UnixTimestamp {
    let mut next = fired + interval_seconds;
    if next.0 <= now.0 {
        let missed = (now.0 - next.0) / interval_seconds + 1;
        next = next + missed * interval_seconds;
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::MockChain;
    use crate::config::DeploymentSecret;
    use crate::keystore::KeyStore;
    use crate::units::NativeAmount;
    use crate::wallet::SpendPolicy;
    use alloy_primitives::U256;
    use alloy_primitives::utils::parse_ether;

    const CHAIN_ID: u64 = 31337;
    const DEST: &str = "0x0000000000000000000000000000000000000001";

    struct Harness {
        manager: StrategyManager,
        chain: Arc<MockChain>,
        dir: tempfile::TempDir,
    }

    fn amount(s: &str) -> NativeAmount {
        NativeAmount::parse(s).unwrap()
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let keystore = Arc::new(
            KeyStore::open(dir.path(), Some(DeploymentSecret::from_bytes([5u8; 32]))).unwrap(),
        );
        let chain = Arc::new(MockChain::new(CHAIN_ID));
        let wallet = Arc::new(WalletManager::new(
            CHAIN_ID,
            chain.clone(),
            keystore,
            SpendPolicy::default(),
        ));
        let manager =
            StrategyManager::open(dir.path(), wallet, chain.clone(), None).unwrap();
        Harness { manager, chain, dir }
    }

    fn funded_agent(h: &Harness, agent_id: &str, ether: &str) -> Address {
        let address = h
            .manager
            .wallet
            .create_wallet(agent_id)
            .unwrap();
        h.chain.fund(address, parse_ether(ether).unwrap());
        address
    }

    fn params(label: &str, agent_id: &str) -> CreateStrategyParams {
        CreateStrategyParams {
            label: label.to_string(),
            agent_id: agent_id.to_string(),
            to_address: DEST.to_string(),
            amount: amount("0.01"),
            interval_seconds: 1,
            max_base_fee_gwei: None,
            daily_cap: None,
        }
    }

    #[test]
    fn lifecycle_transitions() {
        let h = harness();
        funded_agent(&h, "a1", "1");
        let record = h.manager.create(params("daily", "a1")).unwrap();
        assert!(!record.enabled);
        assert_eq!(record.next_run_at, None);

        // Duplicate label.
        assert_eq!(
            h.manager.create(params("daily", "a1")).unwrap_err().kind(),
            "strategy_bad_state"
        );
        // Unknown agent.
        assert_eq!(
            h.manager.create(params("other", "ghost")).unwrap_err().kind(),
            "not_found"
        );

        let now = UnixTimestamp(1_000_000);
        let started = h.manager.start("daily", now).unwrap();
        assert!(started.enabled);
        assert_eq!(started.next_run_at, Some(now));
        assert_eq!(
            h.manager.start("daily", now).unwrap_err().kind(),
            "strategy_bad_state"
        );

        let stopped = h.manager.stop("daily", now + 1).unwrap();
        assert!(!stopped.enabled);
        assert_eq!(stopped.next_run_at, None);
        assert_eq!(
            h.manager.stop("daily", now + 1).unwrap_err().kind(),
            "strategy_bad_state"
        );

        h.manager.delete("daily").unwrap();
        assert_eq!(
            h.manager.get("daily").unwrap_err().kind(),
            "strategy_not_found"
        );
        assert_eq!(
            h.manager.delete("daily").unwrap_err().kind(),
            "strategy_not_found"
        );
    }

    #[tokio::test]
    async fn tick_before_due_is_a_noop() {
        let h = harness();
        funded_agent(&h, "a1", "1");
        h.manager.create(params("daily", "a1")).unwrap();
        let now = UnixTimestamp(1_000_000);
        h.manager.start("daily", now).unwrap();
        let before = h.manager.get("daily").unwrap();

        let result = h.manager.tick("daily", UnixTimestamp(now.0 - 10)).await.unwrap();
        assert_eq!(result.outcome, RunOutcome::SkippedNotDue);
        assert_eq!(h.manager.get("daily").unwrap(), before);
        assert!(h.manager.recent_runs("daily", 10).is_empty());
        assert!(h.chain.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_strategy_never_runs() {
        let h = harness();
        funded_agent(&h, "a1", "1");
        h.manager.create(params("daily", "a1")).unwrap();
        let result = h
            .manager
            .tick("daily", UnixTimestamp(2_000_000))
            .await
            .unwrap();
        assert_eq!(result.outcome, RunOutcome::SkippedNotDue);
        assert!(h.chain.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn daily_cap_gates_third_run_and_resets_next_day() {
        let h = harness();
        funded_agent(&h, "a1", "10");
        let mut p = params("daily", "a1");
        p.daily_cap = Some(amount("0.02"));
        h.manager.create(p).unwrap();

        // Mid-day start so t, t+1, t+2 share a UTC day.
        let t = UnixTimestamp(20_000 * 86_400 + 43_200);
        h.manager.start("daily", t).unwrap();

        let first = h.manager.tick("daily", t).await.unwrap();
        assert_eq!(first.outcome, RunOutcome::Sent);
        let second = h.manager.tick("daily", t + 1).await.unwrap();
        assert_eq!(second.outcome, RunOutcome::Sent);
        let third = h.manager.tick("daily", t + 2).await.unwrap();
        assert_eq!(third.outcome, RunOutcome::SkippedCap);
        assert_eq!(h.chain.sent.lock().unwrap().len(), 2);

        let record = h.manager.get("daily").unwrap();
        assert_eq!(record.spent_today, amount("0.02"));

        // Next UTC day: the counter resets and sends resume.
        let next_day = UnixTimestamp(20_001 * 86_400 + 60);
        let fourth = h.manager.tick("daily", next_day).await.unwrap();
        assert_eq!(fourth.outcome, RunOutcome::Sent);
        assert_eq!(h.manager.get("daily").unwrap().spent_today, amount("0.01"));

        let outcomes: Vec<RunOutcome> = h
            .manager
            .recent_runs("daily", 10)
            .iter()
            .map(|r| r.outcome)
            .collect();
        assert_eq!(
            outcomes,
            [
                RunOutcome::Sent,
                RunOutcome::SkippedCap,
                RunOutcome::Sent,
                RunOutcome::Sent
            ]
        );
    }

    #[tokio::test]
    async fn base_fee_ceiling_skips_without_broadcast() {
        let h = harness();
        funded_agent(&h, "a1", "1");
        let mut p = params("daily", "a1");
        p.max_base_fee_gwei = Some(10);
        h.manager.create(p).unwrap();
        let t = UnixTimestamp(1_000_000);
        h.manager.start("daily", t).unwrap();

        h.chain.set_base_fee_gwei(25);
        let result = h.manager.tick("daily", t).await.unwrap();
        assert_eq!(result.outcome, RunOutcome::SkippedGas);
        assert_eq!(result.next_run_at, Some(t + 1));
        assert!(h.chain.sent.lock().unwrap().is_empty());

        // Fee back under the ceiling: the next tick sends.
        h.chain.set_base_fee_gwei(5);
        let result = h.manager.tick("daily", t + 1).await.unwrap();
        assert_eq!(result.outcome, RunOutcome::Sent);
    }

    #[tokio::test]
    async fn insufficient_balance_skips_via_simulation() {
        let h = harness();
        let address = funded_agent(&h, "a1", "1");
        h.chain.fund(address, U256::from(1u64)); // 1 wei
        h.manager.create(params("daily", "a1")).unwrap();
        let t = UnixTimestamp(1_000_000);
        h.manager.start("daily", t).unwrap();

        let result = h.manager.tick("daily", t).await.unwrap();
        assert_eq!(result.outcome, RunOutcome::SkippedSimulation);
        assert!(h.chain.sent.lock().unwrap().is_empty());
        assert_eq!(h.manager.get("daily").unwrap().next_run_at, Some(t + 1));
    }

    #[tokio::test]
    async fn failed_transfer_records_run_and_surfaces_error() {
        let h = harness();
        funded_agent(&h, "a1", "1");
        h.manager.create(params("daily", "a1")).unwrap();
        let t = UnixTimestamp(1_000_000);
        h.manager.start("daily", t).unwrap();

        *h.chain.reject_sends.lock().unwrap() = Some("gas price too low".into());
        let err = h.manager.tick("daily", t).await.unwrap_err();
        assert_eq!(err.kind(), "rpc_rejected");

        let runs = h.manager.recent_runs("daily", 10);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].outcome, RunOutcome::Failed);
        assert_eq!(runs[0].detail, "rpc_rejected");
        assert_eq!(h.manager.get("daily").unwrap().next_run_at, Some(t + 1));
    }

    #[tokio::test]
    async fn downtime_collapses_into_one_transfer() {
        let h = harness();
        funded_agent(&h, "a1", "10");
        let mut p = params("daily", "a1");
        p.interval_seconds = 60;
        h.manager.create(p).unwrap();
        let t = UnixTimestamp(1_000_000);
        h.manager.start("daily", t).unwrap();

        // The host slept through ~16 intervals.
        let late = UnixTimestamp(t.0 + 1_000);
        let result = h.manager.tick("daily", late).await.unwrap();
        assert_eq!(result.outcome, RunOutcome::Sent);
        assert_eq!(h.chain.sent.lock().unwrap().len(), 1);

        // One jump to the first boundary in the future.
        let next = result.next_run_at.unwrap();
        assert!(next > late);
        assert!(next.0 - late.0 <= 60);
        assert_eq!((next.0 - t.0) % 60, 0);

        // Immediately ticking again does nothing.
        let again = h.manager.tick("daily", late).await.unwrap();
        assert_eq!(again.outcome, RunOutcome::SkippedNotDue);
        assert_eq!(h.chain.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let h = harness();
        funded_agent(&h, "a1", "1");
        h.manager.create(params("daily", "a1")).unwrap();
        let t = UnixTimestamp(1_000_000);
        h.manager.start("daily", t).unwrap();
        h.manager.tick("daily", t).await.unwrap();

        let wallet = Arc::clone(&h.manager.wallet);
        let chain: Arc<dyn ChainOps> = h.chain.clone();
        let reopened = StrategyManager::open(h.dir.path(), wallet, chain, None).unwrap();
        let record = reopened.get("daily").unwrap();
        assert!(record.enabled);
        assert_eq!(record.next_run_at, Some(t + 1));
        assert!(record.last_tx_hash.is_some());
        assert_eq!(reopened.recent_runs("daily", 10).len(), 1);
    }

    #[test]
    fn advance_schedule_lands_strictly_in_the_future() {
        let t = UnixTimestamp(1_000);
        assert_eq!(advance_schedule(t, 60, t), UnixTimestamp(1_060));
        assert_eq!(advance_schedule(t, 60, UnixTimestamp(1_059)), UnixTimestamp(1_060));
        // next would land exactly on `now`: push one more interval.
        assert_eq!(advance_schedule(t, 60, UnixTimestamp(1_060)), UnixTimestamp(1_120));
        // Long downtime: single jump past `now`, on the original grid.
        let next = advance_schedule(t, 60, UnixTimestamp(10_000));
        assert_eq!(next, UnixTimestamp(10_060));
        assert_eq!((next.0 - t.0) % 60, 0);
    }
}
