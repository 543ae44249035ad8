//! Agent allocation under contention

use std::collections::HashSet;
use std::sync::Arc;

use pretty_assertions::assert_eq;

use support_chat::application::services::{AllocationError, AllocationService};
use support_chat::domain::{RoomName, RoomRepository};
use support_chat::presentation::websocket::DirectoryError;

use crate::common::{customer_client, fake_agent, fake_customer, Cluster};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_never_share_an_agent() {
    const AGENTS: i64 = 3;
    const CUSTOMERS: i64 = 12;

    let cluster = Cluster::new((1..=AGENTS).map(fake_agent).collect());

    let tasks: Vec<_> = (0..CUSTOMERS)
        .map(|i| {
            let allocation = cluster.allocation.clone();
            tokio::spawn(async move {
                let customer = fake_customer(100 + i);
                let name = RoomName::for_customer(customer.id);
                allocation.allocate_agent(&customer, &name).await
            })
        })
        .collect();

    let mut allocated = Vec::new();
    let mut unavailable = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(allocation) => allocated.push(allocation),
            Err(AllocationError::NoAgentAvailable) => unavailable += 1,
            Err(e) => panic!("unexpected allocation error: {e}"),
        }
    }

    let agent_ids: HashSet<i64> = allocated.iter().map(|a| a.agent.id).collect();
    assert_eq!(allocated.len(), AGENTS as usize);
    assert_eq!(agent_ids.len(), AGENTS as usize);
    assert_eq!(unavailable, (CUSTOMERS - AGENTS) as usize);
    assert_eq!(cluster.rooms.len(), AGENTS as usize);
}

#[tokio::test]
async fn test_reserved_agent_is_bound_to_room() {
    let cluster = Cluster::new(vec![fake_agent(1)]);
    let customer = fake_customer(100);
    let name = RoomName::for_customer(customer.id);

    let allocation = cluster
        .allocation
        .allocate_agent(&customer, &name)
        .await
        .unwrap();

    let stored = cluster.agents.get(allocation.agent.id).unwrap();
    assert!(!stored.is_free);
    assert_eq!(stored.room_name.as_deref(), Some(name.as_str()));

    let record = cluster.rooms.find_by_name(name.as_str()).await.unwrap().unwrap();
    assert_eq!(record.customer_id, customer.id);
    assert_eq!(record.agent_id, allocation.agent.id);
    assert!(record.is_open());
}

#[tokio::test]
async fn test_no_free_agent_creates_no_room() {
    let cluster = Cluster::new(vec![]);
    let node = cluster.node();
    let customer = fake_customer(100);
    let (client, _rx) = customer_client(customer.id);

    let result = node.create_room_for_match(&customer, &client).await;

    assert!(matches!(
        result,
        Err(DirectoryError::Allocation(AllocationError::NoAgentAvailable))
    ));
    assert!(cluster.rooms.is_empty());
    assert_eq!(node.room_count(), 0);
    assert!(client.room_name().is_none());
}

#[tokio::test]
async fn test_ended_conversation_frees_agent_for_next_customer() {
    let cluster = Cluster::new(vec![fake_agent(1)]);
    let node = cluster.node();
    let first = fake_customer(100);
    let second = fake_customer(101);
    let (first_client, _first_rx) = customer_client(first.id);
    let (second_client, _second_rx) = customer_client(second.id);

    let matched = node.create_room_for_match(&first, &first_client).await.unwrap();
    let busy = node.create_room_for_match(&second, &second_client).await;
    assert!(matches!(
        busy,
        Err(DirectoryError::Allocation(AllocationError::NoAgentAvailable))
    ));

    node.end_conversation(&first, matched.room.name().as_str())
        .await
        .unwrap();

    let rematched = node.create_room_for_match(&second, &second_client).await.unwrap();
    assert_eq!(rematched.allocation.agent.id, 1);
    assert_ne!(rematched.room.name(), matched.room.name());
}

#[tokio::test]
async fn test_agents_are_offered_oldest_first() {
    let mut older = fake_agent(2);
    older.created_at = chrono::Utc::now() - chrono::Duration::hours(1);
    let newer = fake_agent(1);
    let cluster = Cluster::new(vec![newer, older]);
    let allocation: Arc<dyn AllocationService> = cluster.allocation.clone();

    let customer = fake_customer(100);
    let result = allocation
        .allocate_agent(&customer, &RoomName::for_customer(customer.id))
        .await
        .unwrap();

    assert_eq!(result.agent.id, 2);
}
