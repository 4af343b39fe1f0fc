use std::{collections::BTreeSet, sync::Arc};

use futures::future::join_all;
use pretty_assertions::assert_eq;
use rulebridge::{
    exchange::{Context, Exchange, Message, ReferenceTable, ServiceOperation, ACTION_PROPERTY},
    HandlerResult, RulesExchangeHandler, SessionPhase,
};
use serde_json::{json, Value};

use crate::{catalog, config, request};

const CALLERS: i64 = 32;

async fn shared_handler() -> Arc<RulesExchangeHandler> {
    let handler = RulesExchangeHandler::new();
    handler
        .init(config(), ReferenceTable::new(), &catalog())
        .await
        .unwrap();
    Arc::new(handler)
}

fn tagged_request(operation: &str, caller: i64) -> (Exchange, rulebridge::exchange::ReplyReceiver) {
    let message = Message::new(json!({"n": caller})).with_property("caller", json!(caller));
    Exchange::request(ServiceOperation::in_out(operation), message)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fire_all_never_interleaves() {
    let handler = shared_handler().await;

    let tasks = (0..CALLERS).map(|caller| {
        let handler = handler.clone();
        tokio::spawn(async move {
            let (mut exchange, reply) = tagged_request("apply", caller);
            handler.handle_message(&mut exchange).await?;
            HandlerResult::Ok((caller, reply.recv().await.unwrap().content.unwrap()))
        })
    });

    let mut positions = BTreeSet::new();
    for result in join_all(tasks).await {
        let (caller, content) = result.unwrap().unwrap();
        // the fact was stamped while this caller's message was the bound global
        assert_eq!(content["caller"], json!(caller));
        assert_eq!(content["n"], json!(caller));
        positions.insert(content["position"].as_u64().unwrap());
    }

    let expected: BTreeSet<u64> = (0..CALLERS as u64).collect();
    assert_eq!(positions, expected);
    assert_eq!(handler.sessions_created().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_execute_never_shares_sessions() {
    let handler = shared_handler().await;

    let tasks = (0..CALLERS).map(|caller| {
        let handler = handler.clone();
        tokio::spawn(async move {
            let (exchange, reply) = tagged_request("apply", caller);
            let mut exchange =
                exchange.with_context(Context::new().with(ACTION_PROPERTY, json!("EXECUTE")));
            handler.handle_message(&mut exchange).await?;
            HandlerResult::Ok(reply.recv().await.unwrap().content.unwrap())
        })
    });

    for result in join_all(tasks).await {
        let content = result.unwrap().unwrap();
        // every private session saw exactly one fact
        assert_eq!(content["position"], json!(0));
    }
    assert_eq!(handler.session_phase().await, SessionPhase::Absent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_creation_yields_one_session() {
    let handler = shared_handler().await;

    let tasks = (0..16).map(|i| {
        let handler = handler.clone();
        tokio::spawn(async move {
            let (mut exchange, _) = request("ingest", json!({"event": i}));
            handler.handle_message(&mut exchange).await
        })
    });
    for result in join_all(tasks).await {
        result.unwrap().unwrap();
    }

    assert_eq!(handler.sessions_created().await, 1);
    assert!(handler.continuous_worker_running().await);
    handler.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_never_disposes_mid_evaluation() {
    let handler = shared_handler().await;

    let evaluations: Vec<_> = (0..CALLERS).map(|caller| {
        let handler = handler.clone();
        tokio::spawn(async move {
            let (mut exchange, reply) = tagged_request("apply", caller);
            handler.handle_message(&mut exchange).await?;
            HandlerResult::Ok(reply.recv().await.unwrap().content.unwrap_or(Value::Null))
        })
    }).collect();
    let stops: Vec<_> = (0..8)
        .map(|_| {
            let handler = handler.clone();
            tokio::spawn(async move { handler.stop().await })
        })
        .collect();

    // a disposal racing an evaluation would surface as a disposed-session error here
    for result in join_all(evaluations).await {
        let content = result.unwrap().unwrap();
        assert!(content["position"].is_u64());
    }
    for result in join_all(stops).await {
        result.unwrap().unwrap();
    }
    assert!(handler.sessions_created().await >= 1);
}
