//! Balance → alert-level state machine and the monthly commitment sweep.
//!
//! `AlertService::evaluate` is a pure function of the prior state, the
//! observed balance, the current time and a commitments snapshot. It never
//! talks to Monzo or a store; the webhook pipeline executes the returned
//! actions and persists the returned state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::Config;

/// Alert severity, ordered from best to worst.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    #[default]
    None,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_i16(self) -> i16 {
        match self {
            AlertLevel::None => 0,
            AlertLevel::Warning => 1,
            AlertLevel::Critical => 2,
        }
    }

    pub fn from_i16(raw: i16) -> Option<Self> {
        match raw {
            0 => Some(AlertLevel::None),
            1 => Some(AlertLevel::Warning),
            2 => Some(AlertLevel::Critical),
            _ => None,
        }
    }

    pub fn title_prefix(self) -> &'static str {
        match self {
            AlertLevel::Critical => "BALANCE CRITICAL",
            _ => "BALANCE WARNING",
        }
    }

    pub fn color(self) -> &'static str {
        match self {
            AlertLevel::Critical => "#E74C3C",
            _ => "#F1C40F",
        }
    }
}

/// A calendar month, used as the sweep marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn of(at: DateTime<Utc>) -> Self {
        Self {
            year: at.year(),
            month: at.month(),
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| format!("expected YYYY-MM, got {s:?}"))?;
        let year: i32 = year.parse().map_err(|_| format!("bad year in {s:?}"))?;
        let month: u32 = month.parse().map_err(|_| format!("bad month in {s:?}"))?;
        if !(1..=12).contains(&month) {
            return Err(format!("month out of range in {s:?}"));
        }
        Ok(Self { year, month })
    }
}

/// Persisted alert/sweep state for one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertState {
    pub level: AlertLevel,
    pub qualifying_tx_since_last_alert: u32,
    pub last_sweep: Option<YearMonth>,
}

/// One scheduled monthly payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub name: String,
    pub amount_pence: i64,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Point-in-time view of the account's committed monthly payments.
#[derive(Debug, Clone, Default)]
pub struct CommitmentSnapshot {
    commitments: Vec<Commitment>,
}

impl CommitmentSnapshot {
    pub fn new(commitments: Vec<Commitment>) -> Self {
        Self { commitments }
    }

    /// Sum of active, positive commitments.
    pub fn monthly_total(&self) -> i64 {
        self.commitments
            .iter()
            .filter(|c| c.active && c.amount_pence > 0)
            .map(|c| c.amount_pence)
            .sum()
    }
}

/// A side effect the webhook pipeline should perform against Monzo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    PostFeedItem {
        level: AlertLevel,
    },
    UpdateTransactionNote {
        transaction_id: String,
        level: AlertLevel,
    },
    SweepToPot {
        amount_pence: i64,
        pot_id: String,
        period: YearMonth,
    },
}

/// Result of one evaluation: the state to persist and the actions to run,
/// in execution order (feed, note, sweep).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub state: AlertState,
    pub actions: Vec<Action>,
}

impl Evaluation {
    pub fn alerted(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a, Action::PostFeedItem { .. }))
    }
}

#[derive(Debug, Clone)]
pub struct AlertPolicy {
    pub warning_limit: i64,
    pub critical_limit: i64,
    /// Reminder cadence while sustained at WARNING. Always ≥ 1.
    pub alert_frequency: u32,
    /// `Some(pot_id)` when the commitment sweep is enabled.
    pub sweep_pot_id: Option<String>,
}

impl AlertPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            warning_limit: config.warning_limit,
            critical_limit: config.critical_limit,
            alert_frequency: config.alert_frequency.max(1),
            sweep_pot_id: if config.sweep_enabled {
                config.sweep_pot_id.clone()
            } else {
                None
            },
        }
    }

    pub fn level_for(&self, balance_pence: i64) -> AlertLevel {
        if balance_pence < self.critical_limit {
            AlertLevel::Critical
        } else if balance_pence < self.warning_limit {
            AlertLevel::Warning
        } else {
            AlertLevel::None
        }
    }
}

pub struct AlertService {
    policy: AlertPolicy,
}

impl AlertService {
    pub fn new(policy: AlertPolicy) -> Self {
        Self { policy }
    }

    pub fn evaluate(
        &self,
        prior: &AlertState,
        balance_pence: i64,
        now: DateTime<Utc>,
        commitments: &CommitmentSnapshot,
        transaction_id: Option<&str>,
    ) -> Evaluation {
        let target = self.policy.level_for(balance_pence);
        let mut state = AlertState {
            level: target,
            qualifying_tx_since_last_alert: prior.qualifying_tx_since_last_alert,
            last_sweep: prior.last_sweep,
        };

        let should_alert = if target > prior.level {
            info!("Alert level escalated: {:?} -> {:?}", prior.level, target);
            state.qualifying_tx_since_last_alert = 0;
            true
        } else if target < prior.level {
            info!("Alert level improved: {:?} -> {:?}", prior.level, target);
            state.qualifying_tx_since_last_alert = 0;
            false
        } else {
            match target {
                AlertLevel::None => {
                    state.qualifying_tx_since_last_alert = 0;
                    false
                }
                AlertLevel::Critical => {
                    state.qualifying_tx_since_last_alert = 0;
                    true
                }
                AlertLevel::Warning => {
                    let count = prior.qualifying_tx_since_last_alert.saturating_add(1);
                    if count >= self.policy.alert_frequency {
                        state.qualifying_tx_since_last_alert = 0;
                        true
                    } else {
                        state.qualifying_tx_since_last_alert = count;
                        false
                    }
                }
            }
        };

        let mut actions = Vec::new();
        if should_alert {
            actions.push(Action::PostFeedItem { level: target });
            if let Some(tx_id) = transaction_id {
                actions.push(Action::UpdateTransactionNote {
                    transaction_id: tx_id.to_string(),
                    level: target,
                });
            }
        }

        if target == AlertLevel::Critical {
            if let Some(pot_id) = &self.policy.sweep_pot_id {
                let period = YearMonth::of(now);
                if prior.last_sweep != Some(period) {
                    let amount_pence = commitments.monthly_total();
                    if amount_pence > 0 {
                        info!("Commitment sweep due for {period}: {amount_pence}p");
                        actions.push(Action::SweepToPot {
                            amount_pence,
                            pot_id: pot_id.clone(),
                            period,
                        });
                        state.last_sweep = Some(period);
                    } else {
                        debug!("No active commitments, skipping sweep for {period}");
                    }
                }
            }
        }

        Evaluation { state, actions }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy(sweep: bool) -> AlertPolicy {
        AlertPolicy {
            warning_limit: 25_000,
            critical_limit: 10_000,
            alert_frequency: 10,
            sweep_pot_id: sweep.then(|| "pot_reserve".to_string()),
        }
    }

    fn commitments() -> CommitmentSnapshot {
        CommitmentSnapshot::new(vec![
            Commitment { name: "Rent".into(), amount_pence: 90_000, active: true },
            Commitment { name: "Gym".into(), amount_pence: 3_500, active: true },
            Commitment { name: "Old phone".into(), amount_pence: 2_000, active: false },
        ])
    }

    fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, day, 12, 0, 0).unwrap()
    }

    /// Feed a balance sequence through the service, one transaction each.
    fn run(
        service: &AlertService,
        balances: &[i64],
        now: DateTime<Utc>,
    ) -> (AlertState, Vec<Evaluation>) {
        let mut state = AlertState::default();
        let mut evaluations = Vec::new();
        for (i, balance) in balances.iter().enumerate() {
            let tx = format!("tx_{i}");
            let eval = service.evaluate(&state, *balance, now, &commitments(), Some(&tx));
            state = eval.state.clone();
            evaluations.push(eval);
        }
        (state, evaluations)
    }

    #[test]
    fn test_level_thresholds() {
        let p = policy(false);
        assert_eq!(p.level_for(9_999), AlertLevel::Critical);
        assert_eq!(p.level_for(10_000), AlertLevel::Warning);
        assert_eq!(p.level_for(24_999), AlertLevel::Warning);
        assert_eq!(p.level_for(25_000), AlertLevel::None);
    }

    #[test]
    fn test_warning_escalation_fires_once() {
        let service = AlertService::new(policy(false));
        let (state, evals) = run(&service, &[30_000, 20_000, 20_000, 20_000], at(2026, 3, 1));

        let fired: Vec<bool> = evals.iter().map(Evaluation::alerted).collect();
        assert_eq!(fired, vec![false, true, false, false]);
        assert_eq!(state.level, AlertLevel::Warning);
        assert_eq!(state.qualifying_tx_since_last_alert, 2);
    }

    #[test]
    fn test_sustained_critical_fires_every_time() {
        let service = AlertService::new(policy(false));
        let (_, evals) = run(&service, &[5_000, 5_000, 5_000], at(2026, 3, 1));

        assert!(evals.iter().all(Evaluation::alerted));
        assert!(evals.iter().all(|e| e.state.qualifying_tx_since_last_alert == 0));
    }

    #[test]
    fn test_warning_cadence_fires_on_tenth_repeat() {
        let service = AlertService::new(policy(false));
        let mut balances = vec![20_000];
        balances.extend(std::iter::repeat(20_000).take(10));
        let (state, evals) = run(&service, &balances, at(2026, 3, 1));

        let fired: Vec<usize> = evals
            .iter()
            .enumerate()
            .filter(|(_, e)| e.alerted())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(fired, vec![0, 10]);
        assert_eq!(state.qualifying_tx_since_last_alert, 0);
    }

    #[test]
    fn test_alert_actions_carry_level_and_transaction() {
        let service = AlertService::new(policy(false));
        let eval = service.evaluate(
            &AlertState::default(),
            5_000,
            at(2026, 3, 1),
            &commitments(),
            Some("tx_9"),
        );
        assert_eq!(
            eval.actions,
            vec![
                Action::PostFeedItem { level: AlertLevel::Critical },
                Action::UpdateTransactionNote {
                    transaction_id: "tx_9".into(),
                    level: AlertLevel::Critical,
                },
            ]
        );
    }

    #[test]
    fn test_no_note_without_transaction() {
        let service = AlertService::new(policy(false));
        let eval = service.evaluate(
            &AlertState::default(),
            20_000,
            at(2026, 3, 1),
            &commitments(),
            None,
        );
        assert_eq!(eval.actions, vec![Action::PostFeedItem { level: AlertLevel::Warning }]);
    }

    #[test]
    fn test_recovery_to_none_clears_counter_silently() {
        let service = AlertService::new(policy(false));
        let prior = AlertState {
            level: AlertLevel::Warning,
            qualifying_tx_since_last_alert: 7,
            last_sweep: None,
        };
        let eval = service.evaluate(&prior, 40_000, at(2026, 3, 1), &commitments(), Some("tx"));
        assert!(eval.actions.is_empty());
        assert_eq!(eval.state.level, AlertLevel::None);
        assert_eq!(eval.state.qualifying_tx_since_last_alert, 0);
    }

    #[test]
    fn test_critical_to_warning_is_silent_deescalation() {
        let service = AlertService::new(policy(false));
        let prior = AlertState {
            level: AlertLevel::Critical,
            qualifying_tx_since_last_alert: 0,
            last_sweep: None,
        };
        let eval = service.evaluate(&prior, 20_000, at(2026, 3, 1), &commitments(), Some("tx"));
        assert!(eval.actions.is_empty());
        assert_eq!(eval.state.level, AlertLevel::Warning);
    }

    #[test]
    fn test_sweep_once_per_month() {
        let service = AlertService::new(policy(true));
        let march = at(2026, 3, 14);
        let mut state = AlertState::default();
        let mut sweeps = 0;
        for i in 0..10 {
            let eval = service.evaluate(&state, 5_000, march, &commitments(), Some(&format!("tx_{i}")));
            sweeps += eval
                .actions
                .iter()
                .filter(|a| matches!(a, Action::SweepToPot { .. }))
                .count();
            state = eval.state;
        }
        assert_eq!(sweeps, 1);
        assert_eq!(state.last_sweep, Some(YearMonth { year: 2026, month: 3 }));

        let eval = service.evaluate(&state, 5_000, at(2026, 4, 1), &commitments(), Some("tx_10"));
        assert!(eval.actions.contains(&Action::SweepToPot {
            amount_pence: 93_500,
            pot_id: "pot_reserve".into(),
            period: YearMonth { year: 2026, month: 4 },
        }));
    }

    #[test]
    fn test_recovery_keeps_sweep_marker() {
        let service = AlertService::new(policy(true));
        let (state, evals) = run(&service, &[5_000, 30_000, 5_000], at(2026, 3, 2));

        let sweeps_per_step: Vec<usize> = evals
            .iter()
            .map(|e| {
                e.actions
                    .iter()
                    .filter(|a| matches!(a, Action::SweepToPot { .. }))
                    .count()
            })
            .collect();
        assert_eq!(sweeps_per_step, vec![1, 0, 0]);
        assert_eq!(evals[1].state.last_sweep, Some(YearMonth { year: 2026, month: 3 }));
        // Re-entering CRITICAL still escalates, just without a second sweep.
        assert!(evals[2].alerted());
        assert_eq!(state.level, AlertLevel::Critical);
    }

    #[test]
    fn test_sweep_disabled_never_sweeps() {
        let service = AlertService::new(policy(false));
        let (state, evals) = run(&service, &[5_000, 5_000], at(2026, 3, 2));
        assert!(evals
            .iter()
            .flat_map(|e| e.actions.iter())
            .all(|a| !matches!(a, Action::SweepToPot { .. })));
        assert_eq!(state.last_sweep, None);
    }

    #[test]
    fn test_zero_commitments_leave_marker_unset() {
        let service = AlertService::new(policy(true));
        let eval = service.evaluate(
            &AlertState::default(),
            5_000,
            at(2026, 3, 2),
            &CommitmentSnapshot::default(),
            None,
        );
        assert_eq!(eval.actions, vec![Action::PostFeedItem { level: AlertLevel::Critical }]);
        assert_eq!(eval.state.last_sweep, None);
    }

    #[test]
    fn test_year_month_parse_and_display() {
        let ym: YearMonth = "2026-03".parse().unwrap();
        assert_eq!(ym, YearMonth { year: 2026, month: 3 });
        assert_eq!(ym.to_string(), "2026-03");
        assert!("2026-13".parse::<YearMonth>().is_err());
        assert!("202603".parse::<YearMonth>().is_err());
    }
}
