use std::time::Duration;

use pretty_assertions::assert_eq;
use rulebridge::{
    exchange::{
        Context, Exchange, Message, QueueReference, ReferenceTable, ServiceOperation,
        DISPOSE_PROPERTY,
    },
    HandlerError, HandlerResult, QName, RulesExchangeHandler, SessionPhase,
};
use serde_json::json;

use crate::{catalog, config, request, NAMESPACE};

async fn handler() -> HandlerResult<RulesExchangeHandler> {
    let handler = RulesExchangeHandler::new();
    handler
        .init(config(), ReferenceTable::new(), &catalog())
        .await?;
    handler.start().await?;
    Ok(handler)
}

#[tokio::test]
async fn test_execute_doubles_amount() -> HandlerResult<()> {
    let handler = handler().await?;

    let (mut exchange, reply) = request("classify", json!({"amount": 10}));
    handler.handle_message(&mut exchange).await?;

    let reply = reply.recv().await.unwrap();
    assert_eq!(reply.content, Some(json!({"amount": 20})));
    // EXECUTE never touches the stateful slot
    assert_eq!(handler.session_phase().await, SessionPhase::Absent);
    assert_eq!(handler.sessions_created().await, 0);
    Ok(())
}

#[tokio::test]
async fn test_execute_reads_back_message_global() -> HandlerResult<()> {
    let handler = handler().await?;

    let (mut exchange, reply) = request("classify", json!({"redirect": true}));
    handler.handle_message(&mut exchange).await?;

    assert_eq!(reply.recv().await.unwrap().content, Some(json!("redirected")));
    Ok(())
}

#[tokio::test]
async fn test_sequential_fire_all_keeps_session_live() -> HandlerResult<()> {
    let handler = handler().await?;

    let (mut first, first_reply) = request("apply", json!({"n": 1}));
    handler.handle_message(&mut first).await?;
    let session_id = handler.session_id().await;

    let (mut second, second_reply) = request("apply", json!({"n": 2}));
    handler.handle_message(&mut second).await?;

    assert_eq!(
        first_reply.recv().await.unwrap().content,
        Some(json!({"n": 1, "position": 0, "caller": null}))
    );
    assert_eq!(
        second_reply.recv().await.unwrap().content,
        Some(json!({"n": 2, "position": 1, "caller": null}))
    );
    assert_eq!(handler.session_phase().await, SessionPhase::Live);
    assert_eq!(handler.sessions_created().await, 1);
    assert!(session_id.is_some());
    assert_eq!(handler.session_id().await, session_id);
    Ok(())
}

#[tokio::test]
async fn test_missing_entry_point_keeps_worker_alive() -> HandlerResult<()> {
    let (sink, mut delivered) = QueueReference::new(QName::new(NAMESPACE, "Sink"));
    let mut references = ReferenceTable::new();
    references.insert(sink_name(), std::sync::Arc::new(sink) as _);
    let mut config = config();
    config.channels = vec![rulebridge::ChannelConfig::new("out")
        .reference("Sink")
        .operation("notify")];

    let handler = RulesExchangeHandler::new();
    handler.init(config, references, &catalog()).await?;

    let (mut ingest, _) = request("ingest", json!({"event": 1}));
    handler.handle_message(&mut ingest).await?;
    assert!(handler.continuous_worker_running().await);
    let session_id = handler.session_id().await;

    let (mut stream, stream_reply) = request("stream", json!({"event": 2}));
    let result = handler.handle_message(&mut stream).await;
    match result {
        Err(HandlerError::UnknownEntryPoint { entry_point }) => {
            assert_eq!(entry_point, "missing-ep")
        }
        other => panic!("expected UnknownEntryPoint, got {:?}", other),
    }
    drop(stream);
    assert!(stream_reply.recv().await.is_none());

    assert!(handler.continuous_worker_running().await);
    assert_eq!(handler.session_id().await, session_id);

    let (mut again, _) = request("ingest", json!({"event": 3}));
    handler.handle_message(&mut again).await?;

    let mut events = Vec::new();
    while events.len() < 2 {
        let invocation = tokio::time::timeout(Duration::from_secs(2), delivered.recv())
            .await
            .expect("worker delivered nothing")
            .unwrap();
        assert_eq!(invocation.operation.as_deref(), Some("notify"));
        events.push(invocation.message.content.unwrap());
    }
    assert_eq!(events, vec![json!({"event": 1}), json!({"event": 3})]);

    handler.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_failed_invocation_ignores_dispose_directive() -> HandlerResult<()> {
    let handler = handler().await?;

    let (mut ingest, _) = request("ingest", json!({"event": 1}));
    handler.handle_message(&mut ingest).await?;
    let session_id = handler.session_id().await;
    assert!(session_id.is_some());

    let (stream, _) = request("stream", json!({"event": 2}));
    let mut stream = stream.with_context(Context::new().with(DISPOSE_PROPERTY, json!(true)));
    assert!(matches!(
        handler.handle_message(&mut stream).await,
        Err(HandlerError::UnknownEntryPoint { .. })
    ));

    assert!(handler.continuous_worker_running().await);
    assert_eq!(handler.session_phase().await, SessionPhase::Live);
    assert_eq!(handler.session_id().await, session_id);
    assert_eq!(handler.sessions_created().await, 1);

    handler.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_dropped_handler_ends_continuous_worker() -> HandlerResult<()> {
    let (sink, mut delivered) = QueueReference::new(sink_name());
    let mut references = ReferenceTable::new();
    references.insert(sink_name(), std::sync::Arc::new(sink) as _);
    let mut config = config();
    config.channels = vec![rulebridge::ChannelConfig::new("out")
        .reference("Sink")
        .operation("notify")];

    let handler = RulesExchangeHandler::new();
    handler.init(config, references, &catalog()).await?;
    let (mut ingest, _) = request("ingest", json!({"event": 1}));
    handler.handle_message(&mut ingest).await?;
    let first = tokio::time::timeout(Duration::from_secs(2), delivered.recv())
        .await
        .expect("worker delivered nothing");
    assert!(first.is_some());

    drop(handler);

    // every sender goes away once the worker has ended
    let closed = tokio::time::timeout(Duration::from_secs(2), delivered.recv())
        .await
        .expect("continuous worker outlived the handler");
    assert!(closed.is_none());
    Ok(())
}

#[tokio::test]
async fn test_reply_failure_after_committed_evaluation() -> HandlerResult<()> {
    let handler = handler().await?;

    let (mut exchange, reply) = request("apply", json!({"n": 1}));
    drop(reply);
    assert!(matches!(
        handler.handle_message(&mut exchange).await,
        Err(HandlerError::ReplyFailed { .. })
    ));

    // the first fact stayed in the session
    let (mut exchange, reply) = request("apply", json!({"n": 2}));
    handler.handle_message(&mut exchange).await?;
    assert_eq!(
        reply.recv().await.unwrap().content,
        Some(json!({"n": 2, "position": 1, "caller": null}))
    );
    assert_eq!(handler.sessions_created().await, 1);
    Ok(())
}

#[tokio::test]
async fn test_stop_halts_continuous_worker() -> HandlerResult<()> {
    let handler = handler().await?;

    let (mut exchange, reply) = request("ingest", json!({"event": 1}));
    handler.handle_message(&mut exchange).await?;
    // FIRE_UNTIL_HALT replies with an empty payload
    assert_eq!(reply.recv().await.unwrap().content, None);
    assert!(handler.continuous_worker_running().await);

    tokio::time::timeout(Duration::from_secs(2), handler.stop())
        .await
        .expect("stop did not return")?;

    assert!(!handler.continuous_worker_running().await);
    assert_eq!(handler.session_phase().await, SessionPhase::Absent);
    assert!(handler.session_id().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_dispose_directive_recreates_session() -> HandlerResult<()> {
    let handler = handler().await?;

    let (exchange, reply) = request("apply", json!({"n": 1}));
    let mut exchange =
        exchange.with_context(Context::new().with(DISPOSE_PROPERTY, json!(true)));
    handler.handle_message(&mut exchange).await?;
    assert_eq!(
        reply.recv().await.unwrap().content,
        Some(json!({"n": 1, "position": 0, "caller": null}))
    );
    assert_eq!(handler.session_phase().await, SessionPhase::Absent);

    let (mut exchange, reply) = request("apply", json!({"n": 2}));
    handler.handle_message(&mut exchange).await?;
    // a fresh session starts from an empty `seen` list
    assert_eq!(
        reply.recv().await.unwrap().content,
        Some(json!({"n": 2, "position": 0, "caller": null}))
    );
    assert_eq!(handler.session_phase().await, SessionPhase::Live);
    assert_eq!(handler.sessions_created().await, 2);
    Ok(())
}

#[tokio::test]
async fn test_one_way_operation_never_replies() -> HandlerResult<()> {
    let handler = handler().await?;

    let (mut exchange, reply) =
        Exchange::request(ServiceOperation::in_only("classify"), Message::new(json!({"amount": 1})));
    handler.handle_message(&mut exchange).await?;
    drop(exchange);
    assert!(reply.recv().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_unmapped_operation_uses_default_action() -> HandlerResult<()> {
    let handler = handler().await?;

    let (mut exchange, reply) = request("unmapped", json!({"n": 5}));
    handler.handle_message(&mut exchange).await?;

    assert_eq!(
        reply.recv().await.unwrap().content,
        Some(json!({"n": 5, "position": 0, "caller": null}))
    );
    assert_eq!(handler.session_phase().await, SessionPhase::Live);
    Ok(())
}

#[tokio::test]
async fn test_destroyed_handler_rejects_messages() -> HandlerResult<()> {
    let handler = handler().await?;
    let (mut exchange, _) = request("apply", json!({"n": 1}));
    handler.handle_message(&mut exchange).await?;

    handler.destroy().await;
    assert!(!handler.is_initialized().await);
    assert_eq!(handler.session_phase().await, SessionPhase::Absent);

    let (mut exchange, _) = request("apply", json!({"n": 2}));
    assert!(matches!(
        handler.handle_message(&mut exchange).await,
        Err(HandlerError::NotInitialized)
    ));
    assert!(matches!(handler.start().await, Err(HandlerError::NotInitialized)));
    Ok(())
}

fn sink_name() -> QName {
    QName::new(NAMESPACE, "Sink")
}
