use std::{sync::Arc, time::Duration};

use mockall::predicate::*;
use rulebridge::{
    channel::{Channel, ChannelRegistry, LogChannel},
    exchange::{MockServiceReference, ReferenceTable, ServiceReference},
    ChannelConfig, HandlerResult, QName, RulesExchangeHandler,
};
use serde_json::json;
use tokio::sync::mpsc;

use crate::{catalog, config, request, NAMESPACE};

#[tokio::test]
async fn test_channel_invokes_namespaced_reference() -> HandlerResult<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut reference = MockServiceReference::new();
    reference
        .expect_name()
        .returning(|| QName::new(NAMESPACE, "Shipping"));
    reference
        .expect_invoke()
        .with(eq(Some("ship".to_string())), always())
        .times(1)
        .returning(move |_, message| {
            let _ = tx.send(message.content);
            Ok(())
        });

    let mut references = ReferenceTable::new();
    references.insert(
        QName::new(NAMESPACE, "Shipping"),
        Arc::new(reference) as Arc<dyn ServiceReference>,
    );
    let mut config = config();
    config.channels = vec![ChannelConfig::new("out")
        .reference("Shipping")
        .operation("ship")];

    let handler = RulesExchangeHandler::new();
    handler.init(config, references, &catalog()).await?;

    let (mut exchange, _) = request("ingest", json!({"order": 42}));
    handler.handle_message(&mut exchange).await?;

    let delivered = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("nothing delivered");
    assert_eq!(delivered, Some(Some(json!({"order": 42}))));

    handler.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_channel_kind_is_omitted() -> HandlerResult<()> {
    let mut config = config();
    config.channels = vec![ChannelConfig::new("out").kind("smoke-signal")];

    let handler = RulesExchangeHandler::new();
    handler
        .init(config, ReferenceTable::new(), &catalog())
        .await?;

    // the rule's send fails inside the worker; the worker keeps running
    let (mut exchange, _) = request("ingest", json!({"event": 1}));
    handler.handle_message(&mut exchange).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(handler.continuous_worker_running().await);

    handler.stop().await?;
    assert!(!handler.continuous_worker_running().await);
    Ok(())
}

#[tokio::test]
async fn test_custom_channel_kind_registry() -> HandlerResult<()> {
    let registry = ChannelRegistry::empty();
    registry.register("audit-log", |config| {
        Arc::new(LogChannel::new(config)) as Arc<dyn Channel>
    });

    let mut config = config();
    config.channels = vec![ChannelConfig::new("out").kind("audit-log")];

    let handler = RulesExchangeHandler::new();
    handler
        .init_with_channels(config, ReferenceTable::new(), &catalog(), &registry)
        .await?;

    let (mut exchange, reply) = request("ingest", json!({"event": 1}));
    handler.handle_message(&mut exchange).await?;
    assert_eq!(reply.recv().await.unwrap().content, None);

    handler.destroy().await;
    Ok(())
}
