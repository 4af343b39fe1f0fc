//! Property tests for the stateful session cycle driven through the handler.

use proptest::prelude::*;
use rulebridge::{
    exchange::{Context, ReferenceTable, DISPOSE_PROPERTY},
    RulesExchangeHandler, SessionPhase,
};
use serde_json::json;

use crate::{catalog, config, request};

#[derive(Debug, Clone)]
enum Step {
    Apply(u8),
    ApplyThenDispose(u8),
    Stop,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => any::<u8>().prop_map(Step::Apply),
        1 => any::<u8>().prop_map(Step::ApplyThenDispose),
        1 => Just(Step::Stop),
    ]
}

/// Replays `steps` and checks every reply against a model of the session's `seen` list.
async fn replay(steps: &[Step]) -> Result<(), TestCaseError> {
    let handler = RulesExchangeHandler::new();
    handler
        .init(config(), ReferenceTable::new(), &catalog())
        .await
        .map_err(|e| TestCaseError::fail(e.to_string()))?;

    let mut seen: Vec<u8> = Vec::new();
    let mut live = false;
    let mut created = 0u64;

    for step in steps {
        match step {
            Step::Apply(n) | Step::ApplyThenDispose(n) => {
                let dispose = matches!(step, Step::ApplyThenDispose(_));
                let (exchange, reply) = request("apply", json!({"n": n}));
                let mut exchange =
                    exchange.with_context(Context::new().with(DISPOSE_PROPERTY, json!(dispose)));
                handler
                    .handle_message(&mut exchange)
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;

                if !live {
                    live = true;
                    created += 1;
                }
                let content = reply.recv().await.and_then(|m| m.content);
                prop_assert_eq!(content, Some(json!({"n": n, "position": seen.len(), "caller": null})));
                seen.push(*n);

                if dispose {
                    live = false;
                    seen.clear();
                }
            }
            Step::Stop => {
                handler
                    .stop()
                    .await
                    .map_err(|e| TestCaseError::fail(e.to_string()))?;
                live = false;
                seen.clear();
            }
        }

        let expected = if live {
            SessionPhase::Live
        } else {
            SessionPhase::Absent
        };
        prop_assert_eq!(handler.session_phase().await, expected);
        prop_assert_eq!(handler.sessions_created().await, created);
    }

    handler.destroy().await;
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_session_cycle_matches_model(steps in prop::collection::vec(step_strategy(), 1..24)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(replay(&steps))?;
    }
}
