//! Room delivery within and across processes

use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::time::timeout;

use support_chat::infrastructure::broker::{topics, Broker};
use support_chat::presentation::websocket::AssignmentNotice;

use crate::common::{
    agent_client, client_for, customer_client, eventually, fake_agent, fake_customer, next_json,
    Cluster, WAIT,
};

#[tokio::test]
async fn test_support_42_reaches_both_participants() {
    let cluster = Cluster::new(vec![]);
    let customer_node = cluster.node();
    let agent_node = cluster.node();

    let (customer, mut customer_rx) = customer_client(42);
    let (agent, mut agent_rx) = agent_client(7);
    let room = customer_node.join("support-42", &customer).await.unwrap();
    agent_node.join("support-42", &agent).await.unwrap();

    room.broadcast(json!({"text": "I need help"})).await.unwrap();

    // The sender hears its own message too
    assert_eq!(next_json(&mut customer_rx).await, json!({"text": "I need help"}));
    assert_eq!(next_json(&mut agent_rx).await, json!({"text": "I need help"}));
}

#[tokio::test]
async fn test_local_clients_share_one_subscription() {
    let cluster = Cluster::new(vec![]);
    let node = cluster.node();

    let (first, mut first_rx) = customer_client(1);
    let (second, mut second_rx) = agent_client(2);
    let room = node.join("support-local", &first).await.unwrap();
    let same = node.join("support-local", &second).await.unwrap();

    assert_eq!(room.id(), same.id());
    assert_eq!(cluster.broker.subscriber_count("support-local"), 1);

    same.broadcast(json!({"seq": 1})).await.unwrap();
    assert_eq!(next_json(&mut first_rx).await, json!({"seq": 1}));
    assert_eq!(next_json(&mut second_rx).await, json!({"seq": 1}));
}

#[tokio::test]
async fn test_last_leave_unsubscribes_and_rejoin_resumes() {
    let cluster = Cluster::new(vec![]);
    let node = cluster.node();
    let other_node = cluster.node();

    let (client, mut rx) = customer_client(1);
    let room = node.join("support-cycle", &client).await.unwrap();
    assert_eq!(cluster.broker.subscriber_count("support-cycle"), 1);

    assert!(node.leave(&client));
    timeout(WAIT, room.closed()).await.unwrap();
    eventually(|| cluster.broker.subscriber_count("support-cycle") == 0).await;
    assert_eq!(rx.recv().await, None);
    eventually(|| node.room_count() == 0).await;

    let (again, mut again_rx) = customer_client(1);
    let resumed = node.join("support-cycle", &again).await.unwrap();
    assert_ne!(resumed.id(), room.id());

    let (peer, _peer_rx) = agent_client(2);
    let peer_room = other_node.join("support-cycle", &peer).await.unwrap();
    peer_room.broadcast(json!({"text": "welcome back"})).await.unwrap();

    assert_eq!(next_json(&mut again_rx).await, json!({"text": "welcome back"}));
}

#[tokio::test]
async fn test_matched_agent_on_another_node_joins_and_replies() {
    let cluster = Cluster::new(vec![fake_agent(7)]);
    let customer_node = cluster.node();
    let agent_node = cluster.node();

    let agent = cluster.agents.get(7).unwrap();
    let mut notices = cluster.broker.subscribe(&topics::agent(agent.id)).await.unwrap();

    let customer = fake_customer(42);
    let (customer_handle, mut customer_rx) = client_for(&customer);
    let matched = customer_node
        .create_room_for_match(&customer, &customer_handle)
        .await
        .unwrap();

    let payload = timeout(WAIT, notices.next()).await.unwrap().unwrap();
    let notice: AssignmentNotice = serde_json::from_slice(&payload).unwrap();
    assert_eq!(notice.room, matched.room.name().as_str());
    assert_eq!(notice.customer_id, customer.id);

    let (agent_handle, mut agent_rx) = client_for(&agent);
    let agent_room = agent_node
        .join_room(&agent, &agent_handle, &notice.room)
        .await
        .unwrap();

    agent_room.broadcast(json!({"text": "How can I help?"})).await.unwrap();
    assert_eq!(next_json(&mut customer_rx).await, json!({"text": "How can I help?"}));
    assert_eq!(next_json(&mut agent_rx).await, json!({"text": "How can I help?"}));

    matched.room.broadcast(json!({"text": "Thanks"})).await.unwrap();
    assert_eq!(next_json(&mut agent_rx).await, json!({"text": "Thanks"}));
}
