//! # Correlation Engine
//!
//! Consumes persisted security events from a background queue and groups
//! them into higher-order incidents: temporal bursts, brute-force chains,
//! lateral movement and privilege escalation. Each rule keeps per-key
//! rolling windows walked through an Idle → Accumulating → Firing →
//! CoolDown state machine; fired correlations are persisted (with monotonic
//! risk upgrades to participants) before anything is broadcast.

pub mod engine;
pub mod features;
pub mod rules;
pub mod window;

pub use engine::CorrelationEngine;
pub use features::{AnomalyScorer, FeatureVector};
pub use rules::{build_rules, evaluate, rule_key, RuleFire};
pub use window::{KeyState, KeyWindow, WindowEvent};
