//! Usage threshold rules with edge-triggered firing.
//!
//! A rule fires exactly on the crossing where the previous reading was
//! below its threshold and the current reading is at or above it. Staying
//! above the threshold does not re-fire; the first reading only records.

use std::collections::HashMap;

use chad_config::{ActionRule, UsageEvent};

/// A rule that fired, with the reading that crossed it.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredRule {
    pub rule: ActionRule,
    pub value: f64,
}

pub struct ThresholdMonitor {
    rules: Vec<ActionRule>,
    prev: HashMap<UsageEvent, f64>,
}

impl ThresholdMonitor {
    pub fn new(rules: Vec<ActionRule>) -> Self {
        Self {
            rules,
            prev: HashMap::new(),
        }
    }

    /// Evaluate the current readings against all rules.
    ///
    /// Multiple rules on the same event fire independently on the same
    /// check when one reading crosses several thresholds.
    pub fn check(&mut self, readings: &[(UsageEvent, f64)]) -> Vec<FiredRule> {
        let mut fired = Vec::new();

        for &(event, current) in readings {
            let prev = self.prev.get(&event).copied();

            for rule in self.rules.iter().filter(|r| r.event == event) {
                if let Some(prev) = prev {
                    if prev < rule.threshold && current >= rule.threshold {
                        fired.push(FiredRule {
                            rule: rule.clone(),
                            value: current,
                        });
                    }
                }
            }

            self.prev.insert(event, current);
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chad_config::RuleAction;

    fn rule(event: UsageEvent, threshold: f64, action: RuleAction, target: Option<&str>) -> ActionRule {
        ActionRule {
            event,
            threshold,
            action,
            target_account: target.map(str::to_string),
        }
    }

    #[test]
    fn test_first_reading_only_records() {
        let mut monitor = ThresholdMonitor::new(vec![rule(
            UsageEvent::SessionUsage,
            80.0,
            RuleAction::Notify,
            None,
        )]);
        // Even a reading already above threshold does not fire first time
        assert!(monitor.check(&[(UsageEvent::SessionUsage, 95.0)]).is_empty());
    }

    #[test]
    fn test_edge_crossing_fires_once() {
        let mut monitor = ThresholdMonitor::new(vec![rule(
            UsageEvent::SessionUsage,
            80.0,
            RuleAction::Notify,
            None,
        )]);

        assert!(monitor.check(&[(UsageEvent::SessionUsage, 70.0)]).is_empty());
        let fired = monitor.check(&[(UsageEvent::SessionUsage, 85.0)]);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].value, 85.0);

        // Sustained above: no re-fire
        assert!(monitor.check(&[(UsageEvent::SessionUsage, 90.0)]).is_empty());
    }

    #[test]
    fn test_exact_threshold_counts_as_crossing() {
        let mut monitor = ThresholdMonitor::new(vec![rule(
            UsageEvent::WeeklyUsage,
            80.0,
            RuleAction::Notify,
            None,
        )]);
        monitor.check(&[(UsageEvent::WeeklyUsage, 79.9)]);
        let fired = monitor.check(&[(UsageEvent::WeeklyUsage, 80.0)]);
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn test_never_fires_when_prev_at_or_above() {
        let mut monitor = ThresholdMonitor::new(vec![rule(
            UsageEvent::SessionUsage,
            80.0,
            RuleAction::Notify,
            None,
        )]);
        monitor.check(&[(UsageEvent::SessionUsage, 80.0)]);
        assert!(monitor.check(&[(UsageEvent::SessionUsage, 99.0)]).is_empty());
    }

    #[test]
    fn test_refires_after_dropping_below() {
        let mut monitor = ThresholdMonitor::new(vec![rule(
            UsageEvent::ContextUsage,
            50.0,
            RuleAction::Notify,
            None,
        )]);
        monitor.check(&[(UsageEvent::ContextUsage, 40.0)]);
        assert_eq!(monitor.check(&[(UsageEvent::ContextUsage, 60.0)]).len(), 1);
        monitor.check(&[(UsageEvent::ContextUsage, 30.0)]);
        assert_eq!(monitor.check(&[(UsageEvent::ContextUsage, 55.0)]).len(), 1);
    }

    #[test]
    fn test_multiple_rules_same_event_fire_independently() {
        // The usage series 70, 85, 92 against notify@80 and switch@90
        let mut monitor = ThresholdMonitor::new(vec![
            rule(UsageEvent::SessionUsage, 80.0, RuleAction::Notify, None),
            rule(
                UsageEvent::SessionUsage,
                90.0,
                RuleAction::SwitchProvider,
                Some("backup"),
            ),
        ]);

        assert!(monitor.check(&[(UsageEvent::SessionUsage, 70.0)]).is_empty());

        let fired = monitor.check(&[(UsageEvent::SessionUsage, 85.0)]);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule.action, RuleAction::Notify);
        assert_eq!(fired[0].value, 85.0);

        let fired = monitor.check(&[(UsageEvent::SessionUsage, 92.0)]);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule.action, RuleAction::SwitchProvider);
        assert_eq!(fired[0].rule.target_account.as_deref(), Some("backup"));
        assert_eq!(fired[0].value, 92.0);
    }

    #[test]
    fn test_one_jump_can_fire_both_rules() {
        let mut monitor = ThresholdMonitor::new(vec![
            rule(UsageEvent::SessionUsage, 80.0, RuleAction::Notify, None),
            rule(
                UsageEvent::SessionUsage,
                90.0,
                RuleAction::SwitchProvider,
                Some("backup"),
            ),
        ]);
        monitor.check(&[(UsageEvent::SessionUsage, 50.0)]);
        let fired = monitor.check(&[(UsageEvent::SessionUsage, 95.0)]);
        assert_eq!(fired.len(), 2);
    }

    #[test]
    fn test_events_tracked_separately() {
        let mut monitor = ThresholdMonitor::new(vec![
            rule(UsageEvent::SessionUsage, 80.0, RuleAction::Notify, None),
            rule(UsageEvent::WeeklyUsage, 80.0, RuleAction::Notify, None),
        ]);
        monitor.check(&[(UsageEvent::SessionUsage, 70.0)]);
        // Weekly has no prior reading; only session fires
        let fired = monitor.check(&[
            (UsageEvent::SessionUsage, 85.0),
            (UsageEvent::WeeklyUsage, 85.0),
        ]);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule.event, UsageEvent::SessionUsage);
    }
}
