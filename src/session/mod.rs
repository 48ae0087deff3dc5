use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Fill, FillSide};

/// Bounded length of the equity curve ring buffer.
pub const EQUITY_HISTORY_CAP: usize = 512;

/// Bounded length of the rolling event log.
pub const EVENT_LOG_CAP: usize = 256;

const STARTING_DISCIPLINE: f64 = 100.0;

// Discipline rule thresholds. Each rule is computable from the fill alone,
// so replaying a persisted session reproduces the same score.
const OVERSIZE_BALANCE_FRACTION: f64 = 0.25;
const OVERSIZE_PENALTY: f64 = 3.0;
const STOP_BREACH_LOSS_FRACTION: f64 = 0.30;
const STOP_BREACH_PENALTY: f64 = 5.0;
const OVERTRADE_WINDOW_SECS: i64 = 60;
const OVERTRADE_BUY_LIMIT: usize = 3;
const OVERTRADE_PENALTY: f64 = 2.0;
const WINNER_PROFIT_FRACTION: f64 = 0.10;
const WINNER_REWARD: f64 = 1.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: DateTime<Utc>,
    /// Balance plus aggregate unrealized PnL, in SOL.
    pub equity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionEventKind {
    FillApplied { fill_id: Uuid, side: FillSide },
    DisciplineAdjusted { delta: f64, reason: String },
    SessionReset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub ts: DateTime<Utc>,
    pub kind: SessionEventKind,
}

/// Per-session analytics: balance, streaks, discipline, equity curve.
///
/// Observes fills and PnL; never mutates the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Settlement-currency (SOL) balance.
    pub balance: f64,
    /// Cumulative realized PnL in SOL.
    pub realized_sol: f64,
    pub win_streak: u32,
    pub loss_streak: u32,
    /// Rule-adherence score, 0..=100.
    pub discipline_score: f64,
    /// Fill ids in application order.
    pub fill_ids: Vec<Uuid>,
    pub equity_history: VecDeque<EquityPoint>,
    pub events: VecDeque<SessionEvent>,
    pub started_at: DateTime<Utc>,
    /// Buy timestamps inside the overtrading window; pruned as it slides.
    #[serde(default)]
    recent_buys: Vec<DateTime<Utc>>,
}

impl Session {
    pub fn new(starting_balance: f64) -> Self {
        Self {
            balance: starting_balance,
            realized_sol: 0.0,
            win_streak: 0,
            loss_streak: 0,
            discipline_score: STARTING_DISCIPLINE,
            fill_ids: Vec::new(),
            equity_history: VecDeque::new(),
            events: VecDeque::new(),
            started_at: Utc::now(),
            recent_buys: Vec::new(),
        }
    }

    pub fn has_trades(&self) -> bool {
        !self.fill_ids.is_empty()
    }

    /// Apply a buy fill: debit the balance and score sizing/frequency rules
    /// against the pre-trade state.
    pub fn apply_buy(&mut self, fill: &Fill, sol_spent: f64) {
        let pre_trade_balance = self.balance;
        self.balance -= sol_spent;
        self.push_fill(fill);

        if pre_trade_balance > 0.0 && sol_spent > OVERSIZE_BALANCE_FRACTION * pre_trade_balance {
            self.adjust_discipline(-OVERSIZE_PENALTY, "oversized buy", fill.ts);
        }

        let window_start = fill.ts - Duration::seconds(OVERTRADE_WINDOW_SECS);
        self.recent_buys.retain(|ts| *ts > window_start);
        self.recent_buys.push(fill.ts);
        if self.recent_buys.len() >= OVERTRADE_BUY_LIMIT {
            self.adjust_discipline(-OVERTRADE_PENALTY, "overtrading", fill.ts);
        }
    }

    /// Apply a sell fill: credit the balance, accrue realized PnL, update
    /// streaks, and score exit discipline.
    pub fn apply_sell(
        &mut self,
        fill: &Fill,
        sol_credited: f64,
        realized_sol_delta: f64,
        cost_removed_usd: f64,
    ) {
        self.balance += sol_credited;
        self.realized_sol += realized_sol_delta;
        self.push_fill(fill);

        let realized_usd = fill.realized_pnl_delta.unwrap_or(0.0);
        if realized_usd > 0.0 {
            self.win_streak += 1;
            self.loss_streak = 0;
        } else if realized_usd < 0.0 {
            self.loss_streak += 1;
            self.win_streak = 0;
        }
        // Exactly zero leaves both streaks unchanged.

        if cost_removed_usd > 0.0 {
            let fraction = realized_usd / cost_removed_usd;
            if fraction < -STOP_BREACH_LOSS_FRACTION {
                self.adjust_discipline(-STOP_BREACH_PENALTY, "stop discipline breach", fill.ts);
            } else if fraction >= WINNER_PROFIT_FRACTION {
                self.adjust_discipline(WINNER_REWARD, "winner held to target", fill.ts);
            }
        }
    }

    /// Record an equity curve point; oldest entries roll off past the cap.
    pub fn record_equity(&mut self, ts: DateTime<Utc>, equity: f64) {
        self.equity_history.push_back(EquityPoint { ts, equity });
        while self.equity_history.len() > EQUITY_HISTORY_CAP {
            self.equity_history.pop_front();
        }
    }

    /// Reset the session. A session that saw trades is returned for
    /// archival; an untouched one is just overwritten.
    pub fn reset(&mut self, starting_balance: f64) -> Option<Session> {
        let archived = self.has_trades().then(|| self.clone());
        let mut fresh = Session::new(starting_balance);
        fresh.push_event(Utc::now(), SessionEventKind::SessionReset);
        *self = fresh;
        archived
    }

    fn push_fill(&mut self, fill: &Fill) {
        self.fill_ids.push(fill.id);
        self.push_event(
            fill.ts,
            SessionEventKind::FillApplied {
                fill_id: fill.id,
                side: fill.side,
            },
        );
    }

    fn adjust_discipline(&mut self, delta: f64, reason: &str, ts: DateTime<Utc>) {
        let before = self.discipline_score;
        self.discipline_score = (self.discipline_score + delta).clamp(0.0, 100.0);
        if self.discipline_score != before {
            tracing::debug!(delta, reason, score = self.discipline_score, "discipline adjusted");
            self.push_event(
                ts,
                SessionEventKind::DisciplineAdjusted {
                    delta,
                    reason: reason.to_string(),
                },
            );
        }
    }

    fn push_event(&mut self, ts: DateTime<Utc>, kind: SessionEventKind) {
        self.events.push_back(SessionEvent { ts, kind });
        while self.events.len() > EVENT_LOG_CAP {
            self.events.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AssetId;

    fn sell_fill(realized_usd: f64) -> Fill {
        Fill {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            side: FillSide::Sell,
            asset_id: AssetId::from("mint"),
            quantity_delta: -1.0,
            fill_price: 1.0,
            valuation_at_fill: None,
            quote_notional: 1.0,
            realized_pnl_delta: Some(realized_usd),
            price_confidence: 80,
        }
    }

    fn buy_fill(ts: DateTime<Utc>) -> Fill {
        Fill {
            id: Uuid::new_v4(),
            ts,
            side: FillSide::Buy,
            asset_id: AssetId::from("mint"),
            quantity_delta: 1.0,
            fill_price: 1.0,
            valuation_at_fill: None,
            quote_notional: 1.0,
            realized_pnl_delta: None,
            price_confidence: 80,
        }
    }

    #[test]
    fn test_streaks_scenario() {
        // Two losing sells then a winner: loss streak 2 -> reset, win 1.
        let mut session = Session::new(10.0);

        session.apply_sell(&sell_fill(-5.0), 0.1, -0.025, 100.0);
        session.apply_sell(&sell_fill(-3.0), 0.1, -0.015, 100.0);
        assert_eq!(session.loss_streak, 2);
        assert_eq!(session.win_streak, 0);

        session.apply_sell(&sell_fill(4.0), 0.2, 0.02, 100.0);
        assert_eq!(session.loss_streak, 0);
        assert_eq!(session.win_streak, 1);
    }

    #[test]
    fn test_zero_pnl_sell_leaves_streaks() {
        let mut session = Session::new(10.0);
        session.apply_sell(&sell_fill(2.0), 0.1, 0.01, 100.0);
        session.apply_sell(&sell_fill(0.0), 0.1, 0.0, 100.0);
        assert_eq!(session.win_streak, 1);
        assert_eq!(session.loss_streak, 0);
    }

    #[test]
    fn test_balance_movement() {
        let mut session = Session::new(10.0);
        session.apply_buy(&buy_fill(Utc::now()), 1.5);
        assert!((session.balance - 8.5).abs() < 1e-12);

        session.apply_sell(&sell_fill(10.0), 2.0, 0.05, 100.0);
        assert!((session.balance - 10.5).abs() < 1e-12);
        assert!((session.realized_sol - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_oversized_buy_penalized() {
        let mut session = Session::new(10.0);
        // 4 SOL on a 10 SOL balance is past the sizing limit.
        session.apply_buy(&buy_fill(Utc::now()), 4.0);
        assert_eq!(session.discipline_score, 97.0);
    }

    #[test]
    fn test_overtrading_penalized() {
        let mut session = Session::new(100.0);
        let now = Utc::now();
        session.apply_buy(&buy_fill(now), 1.0);
        session.apply_buy(&buy_fill(now + Duration::seconds(5)), 1.0);
        assert_eq!(session.discipline_score, 100.0);
        session.apply_buy(&buy_fill(now + Duration::seconds(10)), 1.0);
        assert_eq!(session.discipline_score, 98.0);
    }

    #[test]
    fn test_stop_breach_penalized_and_clamped() {
        let mut session = Session::new(10.0);
        // Realized -50% of cost removed, repeatedly: score floors at 0.
        for _ in 0..25 {
            session.apply_sell(&sell_fill(-50.0), 0.1, -0.25, 100.0);
        }
        assert_eq!(session.discipline_score, 0.0);
    }

    #[test]
    fn test_winner_reward_capped_at_100() {
        let mut session = Session::new(10.0);
        session.apply_sell(&sell_fill(20.0), 0.5, 0.1, 100.0);
        assert_eq!(session.discipline_score, 100.0);
    }

    #[test]
    fn test_equity_ring_bounded() {
        let mut session = Session::new(10.0);
        let now = Utc::now();
        for i in 0..(EQUITY_HISTORY_CAP + 40) {
            session.record_equity(now + Duration::seconds(i as i64), i as f64);
        }
        assert_eq!(session.equity_history.len(), EQUITY_HISTORY_CAP);
        // Oldest entries dropped first.
        assert_eq!(session.equity_history.front().unwrap().equity, 40.0);
    }

    #[test]
    fn test_reset_archives_only_with_trades() {
        let mut session = Session::new(10.0);
        assert!(session.reset(10.0).is_none());

        session.apply_buy(&buy_fill(Utc::now()), 1.0);
        let archived = session.reset(25.0);
        assert!(archived.is_some());
        assert_eq!(archived.unwrap().fill_ids.len(), 1);
        assert_eq!(session.balance, 25.0);
        assert!(!session.has_trades());
    }
}
