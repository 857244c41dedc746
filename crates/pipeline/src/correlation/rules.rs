//! Correlation rule predicates. Each rule type extracts its grouping key
//! from an event and evaluates its pattern over the key's window; a match
//! yields the raw confidence and the participant set.

use sentinel_core::config::{CorrelationConfig, CorrelationRuleConfig};
use sentinel_core::error::{Error, ErrorCode, Result};
use sentinel_core::types::{CorrelationRule, CorrelationType, EventType, RiskLevel};

use super::window::WindowEvent;

/// A satisfied rule predicate.
#[derive(Debug, Clone)]
pub struct RuleFire {
    /// Rule-specific raw confidence, 0..1
    pub raw_confidence: f64,
    pub participants: Vec<WindowEvent>,
    pub pattern: String,
}

/// Build runtime rules from configuration, rejecting unknown types at
/// startup (rule syntax errors are validation failures).
pub fn build_rules(config: &CorrelationConfig) -> Result<Vec<CorrelationRule>> {
    config
        .rules
        .iter()
        .map(|(id, rule)| build_rule(id, rule))
        .collect()
}

fn build_rule(id: &str, config: &CorrelationRuleConfig) -> Result<CorrelationRule> {
    let correlation_type = CorrelationType::parse(&config.rule_type).ok_or_else(|| {
        Error::new(
            ErrorCode::RuleSyntaxError,
            format!("correlation rule '{}' has unknown type '{}'", id, config.rule_type),
        )
    })?;

    let required_event_types = config
        .required_event_types
        .iter()
        .map(|name| {
            EventType::parse(name).ok_or_else(|| {
                Error::new(
                    ErrorCode::RuleSyntaxError,
                    format!("correlation rule '{}' names unknown event type '{}'", id, name),
                )
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CorrelationRule {
        id: id.to_string(),
        correlation_type,
        time_window_secs: config.time_window_secs,
        min_event_count: config.min_event_count,
        min_confidence: config.min_confidence,
        required_event_types,
        enabled: config.enabled,
        parameters: config.parameters.clone(),
    })
}

/// The grouping key a rule uses for an event; `None` means the event is
/// irrelevant to this rule.
pub fn rule_key(rule: &CorrelationRule, event: &WindowEvent) -> Option<String> {
    if !rule.required_event_types.is_empty()
        && !rule.required_event_types.contains(&event.event_type)
    {
        return None;
    }

    match rule.correlation_type {
        CorrelationType::TemporalBurst => Some(
            event
                .source_ip
                .clone()
                .unwrap_or_else(|| event.host.clone()),
        ),
        CorrelationType::BruteForce | CorrelationType::PrivilegeEscalation => {
            let user = event.user.as_deref()?;
            Some(format!("{}|{}", event.host, user))
        }
        CorrelationType::LateralMovement => event.user.clone(),
    }
}

/// Evaluate a rule over its window.
pub fn evaluate(rule: &CorrelationRule, window: &[WindowEvent]) -> Option<RuleFire> {
    match rule.correlation_type {
        CorrelationType::TemporalBurst => temporal_burst(rule, window),
        CorrelationType::BruteForce => brute_force(rule, window),
        CorrelationType::LateralMovement => lateral_movement(rule, window),
        CorrelationType::PrivilegeEscalation => privilege_escalation(rule, window),
    }
}

/// Default risk floor per correlation type; the final risk is the max of
/// this and the participants' levels.
pub fn risk_floor(correlation_type: CorrelationType) -> RiskLevel {
    match correlation_type {
        CorrelationType::TemporalBurst => RiskLevel::Medium,
        CorrelationType::BruteForce
        | CorrelationType::LateralMovement
        | CorrelationType::PrivilegeEscalation => RiskLevel::High,
    }
}

/// Techniques implied by the pattern itself, unioned with participants'.
pub fn default_techniques(correlation_type: CorrelationType) -> Vec<String> {
    match correlation_type {
        CorrelationType::TemporalBurst => vec![],
        CorrelationType::BruteForce => vec!["T1110".to_string()],
        CorrelationType::LateralMovement => vec!["T1021".to_string()],
        CorrelationType::PrivilegeEscalation => vec!["T1068".to_string()],
    }
}

fn temporal_burst(rule: &CorrelationRule, window: &[WindowEvent]) -> Option<RuleFire> {
    if window.len() < rule.min_event_count {
        return None;
    }
    let mean_confidence = window.iter().map(|e| e.confidence as f64).sum::<f64>()
        / window.len() as f64
        / 100.0;
    if mean_confidence < rule.min_confidence {
        return None;
    }

    // Rate pressure beyond the threshold raises the raw confidence.
    let excess = (window.len() as f64 / rule.min_event_count as f64).min(3.0);
    let raw_confidence = (0.5 + 0.15 * excess).min(0.95);

    Some(RuleFire {
        raw_confidence,
        participants: window.to_vec(),
        pattern: format!("{} events from one source within the window", window.len()),
    })
}

fn brute_force(rule: &CorrelationRule, window: &[WindowEvent]) -> Option<RuleFire> {
    let failures: Vec<&WindowEvent> = window
        .iter()
        .filter(|e| e.event_type == EventType::AuthenticationFailure)
        .collect();
    if failures.len() < rule.min_event_count {
        return None;
    }

    let last_failure_at = failures.last()?.timestamp;
    let success = window.iter().find(|e| {
        e.event_type == EventType::AuthenticationSuccess && e.timestamp >= failures[0].timestamp
    })?;

    // More failures and a tight failure-to-success gap raise confidence.
    let gap_secs = (success.timestamp - last_failure_at).num_seconds().max(0) as f64;
    let failure_factor = ((failures.len() as f64) / (rule.min_event_count as f64 * 2.0)).min(1.0);
    let speed_factor = (1.0 - gap_secs / rule.time_window_secs.max(1) as f64).clamp(0.0, 1.0);
    let raw_confidence = (0.6 + 0.25 * failure_factor + 0.15 * speed_factor).min(0.98);

    let mut participants: Vec<WindowEvent> = failures.into_iter().cloned().collect();
    participants.push(success.clone());

    Some(RuleFire {
        raw_confidence,
        pattern: format!(
            "{} authentication failures followed by a success",
            participants.len() - 1
        ),
        participants,
    })
}

fn lateral_movement(rule: &CorrelationRule, window: &[WindowEvent]) -> Option<RuleFire> {
    use std::collections::HashMap;

    // Same user, same event type, spread across distinct hosts.
    let mut by_type: HashMap<EventType, Vec<&WindowEvent>> = HashMap::new();
    for event in window {
        by_type.entry(event.event_type).or_default().push(event);
    }

    for (event_type, events) in by_type {
        let mut hosts: Vec<&str> = events.iter().map(|e| e.host.as_str()).collect();
        hosts.sort_unstable();
        hosts.dedup();
        if hosts.len() >= rule.min_event_count {
            let host_factor =
                ((hosts.len() as f64) / (rule.min_event_count as f64 * 2.0)).min(1.0);
            return Some(RuleFire {
                raw_confidence: (0.55 + 0.35 * host_factor).min(0.95),
                participants: events.into_iter().cloned().collect(),
                pattern: format!(
                    "same user performed {} on {} distinct hosts",
                    event_type,
                    hosts.len()
                ),
            });
        }
    }
    None
}

fn privilege_escalation(rule: &CorrelationRule, window: &[WindowEvent]) -> Option<RuleFire> {
    let creation = window
        .iter()
        .find(|e| e.event_type == EventType::ProcessCreation)?;
    let escalation = window.iter().find(|e| {
        e.event_type == EventType::PrivilegeEscalation && e.timestamp >= creation.timestamp
    })?;

    let gap_secs = (escalation.timestamp - creation.timestamp).num_seconds().max(0) as f64;
    let speed_factor = (1.0 - gap_secs / rule.time_window_secs.max(1) as f64).clamp(0.0, 1.0);

    // Intermediate events between the pair are allowed and recorded.
    let participants: Vec<WindowEvent> = window
        .iter()
        .filter(|e| {
            e.timestamp >= creation.timestamp && e.timestamp <= escalation.timestamp
        })
        .cloned()
        .collect();

    Some(RuleFire {
        raw_confidence: (0.65 + 0.25 * speed_factor).min(0.95),
        pattern: format!(
            "process creation escalated to elevated privileges within {}s",
            gap_secs as u64
        ),
        participants,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::collections::HashMap;
    use uuid::Uuid;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
    }

    fn event(
        offset_secs: i64,
        event_type: EventType,
        host: &str,
        user: Option<&str>,
    ) -> WindowEvent {
        WindowEvent {
            id: Uuid::new_v4(),
            event_type,
            risk_level: RiskLevel::High,
            confidence: 85,
            timestamp: base() + Duration::seconds(offset_secs),
            host: host.to_string(),
            user: user.map(str::to_owned),
            source_ip: Some("203.0.113.45".to_string()),
            process: Some("lsass.exe".to_string()),
            mitre_techniques: vec!["T1110.001".to_string()],
        }
    }

    fn rule(correlation_type: CorrelationType, min_count: usize) -> CorrelationRule {
        CorrelationRule {
            id: "test".into(),
            correlation_type,
            time_window_secs: 120,
            min_event_count: min_count,
            min_confidence: 0.5,
            required_event_types: vec![],
            enabled: true,
            parameters: HashMap::new(),
        }
    }

    #[test]
    fn brute_force_requires_success_after_failures() {
        let rule = rule(CorrelationType::BruteForce, 5);

        let mut window: Vec<WindowEvent> = (0..8)
            .map(|i| {
                event(
                    i * 7,
                    EventType::AuthenticationFailure,
                    "WIN-SERVER01",
                    Some("administrator"),
                )
            })
            .collect();

        // Failures alone never fire
        assert!(evaluate(&rule, &window).is_none());

        window.push(event(
            90,
            EventType::AuthenticationSuccess,
            "WIN-SERVER01",
            Some("administrator"),
        ));
        let fire = evaluate(&rule, &window).expect("should fire");
        assert_eq!(fire.participants.len(), 9);
        assert!(fire.raw_confidence >= 0.80);
    }

    #[test]
    fn temporal_burst_fires_on_volume_and_confidence() {
        let rule = rule(CorrelationType::TemporalBurst, 10);
        let window: Vec<WindowEvent> = (0..12)
            .map(|i| event(i, EventType::AuthenticationFailure, "WIN-1", None))
            .collect();
        let fire = evaluate(&rule, &window).expect("should fire");
        assert!(fire.raw_confidence >= 0.5);

        let small: Vec<WindowEvent> = window[..5].to_vec();
        assert!(evaluate(&rule, &small).is_none());
    }

    #[test]
    fn lateral_movement_needs_distinct_hosts() {
        let rule = rule(CorrelationType::LateralMovement, 3);

        let same_host: Vec<WindowEvent> = (0..4)
            .map(|i| event(i, EventType::AuthenticationSuccess, "WIN-1", Some("svc")))
            .collect();
        assert!(evaluate(&rule, &same_host).is_none());

        let spread: Vec<WindowEvent> = (0..4)
            .map(|i| {
                event(
                    i,
                    EventType::AuthenticationSuccess,
                    &format!("WIN-{}", i),
                    Some("svc"),
                )
            })
            .collect();
        assert!(evaluate(&rule, &spread).is_some());
    }

    #[test]
    fn privilege_escalation_requires_ordered_pair() {
        let rule = rule(CorrelationType::PrivilegeEscalation, 2);

        let reversed = vec![
            event(0, EventType::PrivilegeEscalation, "WIN-1", Some("admin")),
            event(10, EventType::ProcessCreation, "WIN-1", Some("admin")),
        ];
        assert!(evaluate(&rule, &reversed).is_none());

        let ordered = vec![
            event(0, EventType::ProcessCreation, "WIN-1", Some("admin")),
            event(5, EventType::NetworkConnection, "WIN-1", Some("admin")),
            event(10, EventType::PrivilegeEscalation, "WIN-1", Some("admin")),
        ];
        let fire = evaluate(&rule, &ordered).expect("should fire");
        // Intermediate event is captured as a participant
        assert_eq!(fire.participants.len(), 3);
    }

    #[test]
    fn keys_group_by_rule_semantics() {
        let burst = rule(CorrelationType::TemporalBurst, 10);
        let brute = rule(CorrelationType::BruteForce, 5);
        let lateral = rule(CorrelationType::LateralMovement, 3);

        let e = event(0, EventType::AuthenticationFailure, "WIN-1", Some("admin"));
        assert_eq!(rule_key(&burst, &e).unwrap(), "203.0.113.45");
        assert_eq!(rule_key(&brute, &e).unwrap(), "WIN-1|admin");
        assert_eq!(rule_key(&lateral, &e).unwrap(), "admin");

        let mut no_ip = e.clone();
        no_ip.source_ip = None;
        assert_eq!(rule_key(&burst, &no_ip).unwrap(), "WIN-1");

        let mut no_user = e;
        no_user.user = None;
        assert!(rule_key(&brute, &no_user).is_none());
    }

    #[test]
    fn unknown_rule_type_is_rejected() {
        let mut rules = HashMap::new();
        rules.insert(
            "bad".to_string(),
            CorrelationRuleConfig {
                rule_type: "time_travel".into(),
                time_window_secs: 60,
                min_event_count: 3,
                min_confidence: 0.5,
                required_event_types: vec![],
                enabled: true,
                parameters: HashMap::new(),
            },
        );
        let config = CorrelationConfig {
            rules,
            ..Default::default()
        };
        let err = build_rules(&config).unwrap_err();
        assert_eq!(err.code, ErrorCode::RuleSyntaxError);
    }
}
