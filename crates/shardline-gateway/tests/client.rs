//! Client facade tests over several scripted shards.

use std::sync::Arc;
use std::time::Duration;

use shardline_events::ShardEvent;
use shardline_gateway::protocol::{close_code, opcode};
use shardline_gateway::{GatewayClient, MemoryCache, ShardConfig, Status};
use shardline_test::{MockConnector, fixtures, init_test_logging};
use tokio::time::timeout;

#[tokio::test(start_paused = true)]
async fn shards_share_bus_and_cache() {
    init_test_logging();
    let (connector, mut servers) = MockConnector::new();
    let cache = Arc::new(MemoryCache::new());
    let client = GatewayClient::new(
        vec![ShardConfig::new("token", 0, 2), ShardConfig::new("token", 1, 2)],
        Arc::new(connector),
        cache.clone(),
    );
    let mut events = client.subscribe();
    client.connect_all().await.unwrap();

    let mut live = Vec::new();
    for _ in 0..2 {
        let mut server = timeout(Duration::from_secs(10), servers.next())
            .await
            .unwrap()
            .unwrap();
        server.send_packet(&fixtures::hello(41_250));
        let identify = server.expect_payload(opcode::IDENTIFY).await;
        let index = identify["shard"][0].as_u64().unwrap();
        let guild = format!("guild-{index}");
        server.send_packet(&fixtures::ready(&format!("s{index}"), 1, &[guild.as_str()]));
        server.send_packet(&fixtures::guild_create(&guild, 2));
        live.push(server);
    }

    let mut ready = Vec::new();
    while ready.len() < 2 {
        let event = events.recv().await.unwrap();
        if let ShardEvent::ShardReady { metadata, .. } = &*event {
            ready.push(metadata.shard_id);
        }
    }
    ready.sort_unstable();
    assert_eq!(ready, vec![0, 1]);

    for index in 0..2 {
        let shard = client.shard(index).unwrap();
        shard.wait_for_status(Status::Ready).await.unwrap();
        assert_eq!(shard.session_id(), Some(format!("s{index}")));
    }
    assert_eq!(client.ping(), Duration::ZERO);
    assert_eq!(cache.guild_count(), 2);
    assert_eq!(client.cache().guilds_for_shard(1)[0].id, "guild-1");

    client.destroy_all().await.unwrap();
    for server in &mut live {
        assert_eq!(server.expect_close().await, close_code::NORMAL);
    }
    client.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn presence_update_bypasses_the_queue() {
    init_test_logging();
    let (connector, mut servers) = MockConnector::new();
    let client = GatewayClient::new(
        vec![ShardConfig::new("token", 0, 1)],
        Arc::new(connector),
        Arc::new(MemoryCache::new()),
    );
    client.connect_all().await.unwrap();
    let mut server = servers.next().await.unwrap();
    server.send_packet(&fixtures::hello(41_250));
    server.expect_op(opcode::IDENTIFY).await;

    // Forced packets go out before READY.
    let shard = client.shard(0).unwrap();
    shard
        .update_presence(shardline_gateway::Presence::new("idle").playing("chess"))
        .await
        .unwrap();
    let presence = server.expect_payload(opcode::PRESENCE_UPDATE).await;
    assert_eq!(presence["status"], "idle");
    assert_eq!(presence["activities"][0]["name"], "chess");

    client.shutdown().await;
}
