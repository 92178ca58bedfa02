//! 熔断器状态机
//!
//! 状态迁移规则集中在`BreakerRecord`上，内存存储直接调用，Redis存储的Lua脚本与之保持一致。

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::value_objects::CircuitState;

/// 存储中的熔断器记录
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub state: CircuitState,
    pub fail_counter: u32,
    pub success_counter: u32,
    pub opened_at_ms: Option<i64>,
    pub last_failure_ms: Option<i64>,
    /// 半开探测调用的开始时间，探测期间其他调用被拒绝
    pub trial_started_ms: Option<i64>,
}

/// 状态迁移
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// 调用许可
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPermit {
    /// 闭合状态下正常放行
    Admitted,
    /// 半开状态下的探测调用
    Trial,
    Rejected { retry_after_ms: i64 },
}

impl BreakerPermit {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, BreakerPermit::Rejected { .. })
    }
}

/// 一次原子的许可判定结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerAcquire {
    pub permit: BreakerPermit,
    pub transition: Option<StateTransition>,
    pub record: BreakerRecord,
}

/// 一次原子的结果记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerUpdate {
    pub transition: Option<StateTransition>,
    pub record: BreakerRecord,
}

impl BreakerRecord {
    fn move_to(&mut self, to: CircuitState) -> Option<StateTransition> {
        if self.state == to {
            return None;
        }
        let from = self.state;
        self.state = to;
        Some(StateTransition { from, to })
    }

    fn open(&mut self, now_ms: i64) -> Option<StateTransition> {
        self.opened_at_ms = Some(now_ms);
        self.trial_started_ms = None;
        self.move_to(CircuitState::Open)
    }

    fn close(&mut self) -> Option<StateTransition> {
        self.fail_counter = 0;
        self.success_counter = 0;
        self.opened_at_ms = None;
        self.trial_started_ms = None;
        self.move_to(CircuitState::Closed)
    }

    pub fn acquire(&mut self, reset_timeout_ms: i64, now_ms: i64) -> BreakerAcquire {
        let (permit, transition) = match self.state {
            CircuitState::Closed => (BreakerPermit::Admitted, None),
            CircuitState::Open => {
                let opened_at = self.opened_at_ms.unwrap_or(now_ms);
                let elapsed = now_ms - opened_at;
                if elapsed >= reset_timeout_ms {
                    self.trial_started_ms = Some(now_ms);
                    (BreakerPermit::Trial, self.move_to(CircuitState::HalfOpen))
                } else {
                    (
                        BreakerPermit::Rejected {
                            retry_after_ms: reset_timeout_ms - elapsed,
                        },
                        None,
                    )
                }
            }
            CircuitState::HalfOpen => match self.trial_started_ms {
                Some(started) if now_ms - started < reset_timeout_ms => (
                    BreakerPermit::Rejected {
                        retry_after_ms: reset_timeout_ms - (now_ms - started),
                    },
                    None,
                ),
                _ => {
                    self.trial_started_ms = Some(now_ms);
                    (BreakerPermit::Trial, None)
                }
            },
        };
        BreakerAcquire {
            permit,
            transition,
            record: *self,
        }
    }

    pub fn record_success(&mut self) -> BreakerUpdate {
        let transition = match self.state {
            CircuitState::Closed => {
                self.fail_counter = 0;
                self.success_counter = self.success_counter.saturating_add(1);
                None
            }
            CircuitState::HalfOpen => self.close(),
            // 打开前已放行的调用，结果不影响状态
            CircuitState::Open => None,
        };
        BreakerUpdate {
            transition,
            record: *self,
        }
    }

    pub fn record_failure(&mut self, fail_max: u32, now_ms: i64) -> BreakerUpdate {
        self.last_failure_ms = Some(now_ms);
        let transition = match self.state {
            CircuitState::Closed => {
                self.fail_counter = self.fail_counter.saturating_add(1);
                if self.fail_counter >= fail_max {
                    self.open(now_ms)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.fail_counter = self.fail_counter.saturating_add(1);
                self.open(now_ms)
            }
            CircuitState::Open => None,
        };
        BreakerUpdate {
            transition,
            record: *self,
        }
    }

    pub fn force(&mut self, state: CircuitState, now_ms: i64) -> BreakerUpdate {
        let transition = match state {
            CircuitState::Closed => self.close(),
            CircuitState::Open => self.open(now_ms),
            CircuitState::HalfOpen => {
                self.trial_started_ms = None;
                self.move_to(CircuitState::HalfOpen)
            }
        };
        BreakerUpdate {
            transition,
            record: *self,
        }
    }
}

/// 熔断器快照，供运维接口与指标使用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub fail_counter: u32,
    pub success_counter: u32,
    pub fail_max: u32,
    pub reset_timeout_secs: u64,
    pub last_failure: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
}

impl BreakerSnapshot {
    pub fn from_record(
        name: impl Into<String>,
        record: &BreakerRecord,
        fail_max: u32,
        reset_timeout_secs: u64,
    ) -> Self {
        let to_time = |ms: Option<i64>| ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        Self {
            name: name.into(),
            state: record.state,
            fail_counter: record.fail_counter,
            success_counter: record.success_counter,
            fail_max,
            reset_timeout_secs,
            last_failure: to_time(record.last_failure_ms),
            opened_at: to_time(record.opened_at_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESET_MS: i64 = 60_000;

    #[test]
    fn test_opens_after_fail_max_consecutive_failures() {
        let mut record = BreakerRecord::default();
        assert!(record.record_failure(3, 1).transition.is_none());
        assert!(record.record_failure(3, 2).transition.is_none());
        let update = record.record_failure(3, 3);
        assert_eq!(
            update.transition,
            Some(StateTransition {
                from: CircuitState::Closed,
                to: CircuitState::Open
            })
        );
        assert_eq!(record.fail_counter, 3);
        assert_eq!(record.opened_at_ms, Some(3));
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let mut record = BreakerRecord::default();
        record.record_failure(3, 1);
        record.record_failure(3, 2);
        record.record_success();
        assert_eq!(record.fail_counter, 0);
        record.record_failure(3, 3);
        assert_eq!(record.state, CircuitState::Closed);
    }

    #[test]
    fn test_open_rejects_until_reset_timeout() {
        let mut record = BreakerRecord::default();
        record.record_failure(1, 1_000);

        let acquire = record.acquire(RESET_MS, 31_000);
        assert_eq!(
            acquire.permit,
            BreakerPermit::Rejected {
                retry_after_ms: 30_000
            }
        );

        let acquire = record.acquire(RESET_MS, 61_000);
        assert_eq!(acquire.permit, BreakerPermit::Trial);
        assert_eq!(record.state, CircuitState::HalfOpen);
    }

    #[test]
    fn test_single_trial_in_half_open() {
        let mut record = BreakerRecord::default();
        record.record_failure(1, 0);
        assert_eq!(record.acquire(RESET_MS, RESET_MS).permit, BreakerPermit::Trial);
        assert!(!record.acquire(RESET_MS, RESET_MS + 10).permit.is_allowed());
        // 探测租约过期后由下一个调用方接替
        assert_eq!(
            record.acquire(RESET_MS, 2 * RESET_MS).permit,
            BreakerPermit::Trial
        );
    }

    #[test]
    fn test_trial_success_closes_and_resets_counters() {
        let mut record = BreakerRecord::default();
        record.record_failure(1, 0);
        record.acquire(RESET_MS, RESET_MS);
        let update = record.record_success();
        assert_eq!(update.transition.map(|t| t.to), Some(CircuitState::Closed));
        assert_eq!(record.fail_counter, 0);
        assert_eq!(record.success_counter, 0);
        assert_eq!(record.opened_at_ms, None);
    }

    #[test]
    fn test_trial_failure_reopens_and_restarts_timeout() {
        let mut record = BreakerRecord::default();
        record.record_failure(1, 0);
        record.acquire(RESET_MS, RESET_MS);
        let update = record.record_failure(1, RESET_MS + 5);
        assert_eq!(update.transition.map(|t| t.to), Some(CircuitState::Open));
        assert_eq!(record.opened_at_ms, Some(RESET_MS + 5));
        assert!(!record.acquire(RESET_MS, RESET_MS + 10).permit.is_allowed());
    }

    #[test]
    fn test_failure_while_open_does_not_count() {
        let mut record = BreakerRecord::default();
        record.record_failure(1, 0);
        record.record_failure(1, 5);
        assert_eq!(record.fail_counter, 1);
        assert_eq!(record.last_failure_ms, Some(5));
    }

    #[test]
    fn test_force_close_resets() {
        let mut record = BreakerRecord::default();
        record.record_failure(1, 0);
        let update = record.force(CircuitState::Closed, 10);
        assert_eq!(update.transition.map(|t| t.to), Some(CircuitState::Closed));
        assert_eq!(record, BreakerRecord { last_failure_ms: Some(0), ..BreakerRecord::default() });
    }

    #[test]
    fn test_snapshot_converts_timestamps() {
        let mut record = BreakerRecord::default();
        record.record_failure(1, 1_700_000_000_000);
        let snapshot = BreakerSnapshot::from_record("db", &record, 1, 60);
        assert_eq!(snapshot.state, CircuitState::Open);
        assert_eq!(
            snapshot.opened_at.map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
    }
}
