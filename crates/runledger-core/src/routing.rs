//! Destination selection for messages and statistics.
//!
//! Pure functions of the processor state; deleted-testcase filtering is left
//! to the caller.

use serde::{Deserialize, Serialize};

use crate::event::EntityId;
use crate::lifecycle::{LifecycleState, ProcessorState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Run and suite messages are disabled.
    HookMessagesDisabled,
    /// No run, suite or testcase can take the message.
    NoTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "route", content = "id", rename_all = "snake_case")]
pub enum MessageRoute {
    Run(EntityId),
    Suite(EntityId),
    Testcase(EntityId),
    Drop(DropReason),
}

/// Decide where a message goes.
///
/// Checked in order:
/// 1. run level: an open run outside an after-class hook, an explicit run
///    message, or an after-suite hook
/// 2. testcase level: an open testcase, or inside an after-method hook the
///    last executed one, even when another testcase is open
/// 3. suite level: an open suite, or the last ended one inside an
///    after-class hook
///
/// Run and suite messages are only kept when `persist_hook_messages` is set.
#[must_use]
pub fn route_message(
    state: &ProcessorState,
    is_run_message: bool,
    persist_hook_messages: bool,
) -> MessageRoute {
    let lifecycle = state.lifecycle();
    let hooks = state.hooks();

    if (lifecycle == LifecycleState::RunStarted && !hooks.after_class)
        || is_run_message
        || hooks.after_suite
    {
        if !persist_hook_messages {
            return MessageRoute::Drop(DropReason::HookMessagesDisabled);
        }
        let run_id = if is_run_message && state.testcase().is_joined() {
            state.testcase().run_id
        } else {
            state.run_id()
        };
        return run_id.map_or(MessageRoute::Drop(DropReason::NoTarget), MessageRoute::Run);
    }

    if lifecycle == LifecycleState::TestCaseStarted || hooks.after_method {
        let testcase_id = if hooks.after_method {
            state.last_executed_testcase_id()
        } else {
            state.testcase_id()
        };
        return testcase_id.map_or(
            MessageRoute::Drop(DropReason::NoTarget),
            MessageRoute::Testcase,
        );
    }

    if lifecycle == LifecycleState::SuiteStarted || hooks.after_class {
        if !persist_hook_messages {
            return MessageRoute::Drop(DropReason::HookMessagesDisabled);
        }
        let suite_id = if lifecycle == LifecycleState::SuiteStarted {
            state.suite_id()
        } else {
            state.last_ended_suite_id()
        };
        return suite_id.map_or(MessageRoute::Drop(DropReason::NoTarget), MessageRoute::Suite);
    }

    MessageRoute::Drop(DropReason::NoTarget)
}

/// Testcase that receives statistics: the open one, or inside an
/// after-method hook the last executed one.
#[must_use]
pub fn statistics_target(state: &ProcessorState) -> Option<EntityId> {
    state.testcase_id().or_else(|| {
        if state.hooks().after_method {
            state.last_executed_testcase_id()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, JoinedTestcase};

    fn in_testcase() -> ProcessorState {
        let mut state = ProcessorState::default();
        state.begin_run(1, "run");
        state.begin_suite(2);
        state.begin_testcase(3);
        state
    }

    #[test]
    fn testcase_message_goes_to_current_testcase() {
        let state = in_testcase();
        assert_eq!(route_message(&state, false, false), MessageRoute::Testcase(3));
    }

    #[test]
    fn run_message_needs_flag() {
        let state = in_testcase();
        assert_eq!(
            route_message(&state, true, false),
            MessageRoute::Drop(DropReason::HookMessagesDisabled)
        );
        assert_eq!(route_message(&state, true, true), MessageRoute::Run(1));
    }

    #[test]
    fn run_started_routes_to_run() {
        let mut state = ProcessorState::default();
        state.begin_run(1, "run");
        assert_eq!(route_message(&state, false, true), MessageRoute::Run(1));
    }

    #[test]
    fn after_method_routes_to_last_executed_testcase() {
        let mut state = in_testcase();
        state.end_testcase();
        state.hooks_mut().apply(EventKind::StartAfterMethod);
        assert_eq!(route_message(&state, false, false), MessageRoute::Testcase(3));
    }

    #[test]
    fn after_method_prefers_last_executed_over_open_testcase() {
        let mut state = in_testcase();
        state.end_testcase();
        state.begin_testcase(4);
        state.hooks_mut().apply(EventKind::StartAfterMethod);
        assert_eq!(state.testcase_id(), Some(4));
        assert_eq!(route_message(&state, false, false), MessageRoute::Testcase(3));

        state.hooks_mut().apply(EventKind::EndAfterMethod);
        assert_eq!(route_message(&state, false, false), MessageRoute::Testcase(4));
    }

    #[test]
    fn after_class_routes_to_last_ended_suite() {
        let mut state = in_testcase();
        state.end_testcase();
        state.end_suite(true);
        state.hooks_mut().apply(EventKind::StartAfterClass);
        assert_eq!(state.lifecycle(), LifecycleState::RunStarted);
        assert_eq!(route_message(&state, false, true), MessageRoute::Suite(2));
        assert_eq!(
            route_message(&state, false, false),
            MessageRoute::Drop(DropReason::HookMessagesDisabled)
        );
    }

    #[test]
    fn after_suite_routes_to_run() {
        let mut state = in_testcase();
        state.hooks_mut().apply(EventKind::StartAfterSuite);
        assert_eq!(route_message(&state, false, true), MessageRoute::Run(1));
    }

    #[test]
    fn suite_started_routes_to_suite() {
        let mut state = ProcessorState::default();
        state.begin_run(1, "run");
        state.begin_suite(2);
        assert_eq!(route_message(&state, false, true), MessageRoute::Suite(2));
    }

    #[test]
    fn joined_run_message_uses_joined_run() {
        let mut state = ProcessorState::default();
        state.join_testcase(JoinedTestcase {
            run_id: 40,
            testcase_id: 41,
        });
        assert_eq!(route_message(&state, true, true), MessageRoute::Run(40));
        assert_eq!(route_message(&state, false, true), MessageRoute::Testcase(41));
    }

    #[test]
    fn initialized_drops() {
        let state = ProcessorState::default();
        assert_eq!(
            route_message(&state, false, true),
            MessageRoute::Drop(DropReason::NoTarget)
        );
    }

    #[test]
    fn statistics_target_rules() {
        let mut state = in_testcase();
        assert_eq!(statistics_target(&state), Some(3));
        state.end_testcase();
        assert_eq!(statistics_target(&state), None);
        state.hooks_mut().apply(EventKind::StartAfterMethod);
        assert_eq!(statistics_target(&state), Some(3));
    }
}
