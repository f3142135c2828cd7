use crate::*;

use std::sync::Arc;
use std::thread;

use terrace_core::config::TerraceConfig;
use terrace_core::node::{NodeId, ServerId};
use terrace_group::{
    GroupBody, GroupError, GroupManager, GroupMessage, GroupMessageType, LocalGroupManager, LocalHub,
    MessageIdFactory, NullGroupManager,
};

#[test]
fn zap_requests_from_two_threads_get_distinct_increasing_ids() -> Result<()> {
    init_tracing();
    let ids = Arc::new(MessageIdFactory::new());
    let workers: Vec<_> = (0..2)
        .map(|_| {
            let ids = ids.clone();
            thread::spawn(move || GroupMessage::zap_node_request(&ids, 1, "partition", vec![10, 20]))
        })
        .collect();
    let mut messages = Vec::new();
    for worker in workers {
        messages.push(worker.join().map_err(|_| anyhow::anyhow!("worker panicked"))?);
    }
    messages.sort_by_key(|m| m.id());
    assert!(messages[0].id() < messages[1].id());

    // ids survive encoding
    let pool = ChunkPool::default();
    for message in &messages {
        let received = transmit(message.to_wire(&pool)?, &pool, 5)?;
        assert_eq!(&GroupMessage::from_wire(&received[0])?, message);
    }
    Ok(())
}

#[test]
fn three_node_group_broadcast_and_wait() -> Result<()> {
    init_tracing();
    let config = TerraceConfig::default();
    let hub = LocalHub::from_config(&config);
    let servers: Vec<ServerId> = ["a", "b", "c"].iter().map(|n| ServerId::generate(*n)).collect();
    let members: Vec<LocalGroupManager> = servers
        .iter()
        .map(|s| LocalGroupManager::new(&hub, s.clone(), &config.group))
        .collect();
    for member in &members {
        member.join(&servers)?;
    }

    for member in &members[1..] {
        let responder = member.clone();
        member.register_for_messages(
            GroupMessageType::Application,
            Arc::new(move |from: &NodeId, message: GroupMessage| {
                let echo = match message.body() {
                    GroupBody::Application(data) => GroupBody::Application(data.clone()),
                    _ => GroupBody::Ack,
                };
                let reply = GroupMessage::response_to(responder.message_ids(), &message, echo);
                if let Err(e) = responder.send_to(from, reply) {
                    tracing::warn!(error = %e, "reply failed");
                }
            }),
        )?;
    }

    let request = GroupMessage::new(
        members[0].message_ids(),
        GroupBody::Application(Bytes::from_static(b"state?")),
    );
    let response = members[0].send_all_and_wait_for_response(request)?;
    assert_eq!(response.len(), 2);
    for server in &servers[1..] {
        let reply = response
            .response_from(&NodeId::from(server.clone()))
            .context("missing reply")?;
        assert_eq!(reply.body(), &GroupBody::Application(Bytes::from_static(b"state?")));
    }

    let state = members[0].state_map();
    assert_eq!(state["members"].as_array().map(Vec::len), Some(2));

    for member in &members {
        member.disconnect();
    }
    assert!(hub.is_empty());
    Ok(())
}

#[test]
fn single_node_group_behind_the_trait() -> Result<()> {
    init_tracing();
    let group: Box<dyn GroupManager> = Box::new(NullGroupManager::new(ServerId::generate("solo")));
    let message = GroupMessage::new(group.message_ids(), GroupBody::Ack);
    assert!(matches!(group.send_all(message.clone()), Err(GroupError::NotJoined)));

    let me = group.join(&[])?;
    group.send_all(message.clone())?;
    assert!(group.send_all_and_wait_for_response(message.clone())?.is_empty());
    assert!(matches!(
        group.send_to(&me, message),
        Err(GroupError::UnknownNode(_))
    ));
    Ok(())
}
