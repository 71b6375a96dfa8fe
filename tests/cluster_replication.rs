use std::path::Path;

use anyhow::Context as _;
use clap::Parser;
use pretty_assertions::assert_eq;
use replikv::{
    config::{Cli, Config},
    node::{RunningNode, start_on},
};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn bind() -> anyhow::Result<(TcpListener, String)> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .context("bind node listener")?;
    let addr = listener.local_addr().context("node local_addr")?.to_string();
    Ok((listener, addr))
}

fn node_config(dir: &Path, self_addr: &str, leader_addr: &str, peers: &[String]) -> Config {
    let dir = dir.to_string_lossy().to_string();
    let role = if self_addr == leader_addr {
        "leader"
    } else {
        "follower"
    };
    let mut args = vec![
        "replikv".to_string(),
        "--snapshot-dir".to_string(),
        dir,
        "--self-addr".to_string(),
        self_addr.to_string(),
        "--leader-addr".to_string(),
        leader_addr.to_string(),
        "--role".to_string(),
        role.to_string(),
    ];
    if !peers.is_empty() {
        args.push("--peers".to_string());
        args.push(peers.join(","));
    }
    Cli::try_parse_from(args).unwrap().config
}

struct Cluster {
    _tmp: tempfile::TempDir,
    leader: RunningNode,
    followers: Vec<RunningNode>,
}

impl Cluster {
    /// One leader and `n` followers; the leader replicates to every follower in order.
    async fn start(n: usize) -> anyhow::Result<Self> {
        let tmp = tempfile::tempdir()?;
        let (leader_listener, leader_addr) = bind().await?;

        let mut followers = Vec::new();
        let mut follower_addrs = Vec::new();
        for i in 0..n {
            let (listener, addr) = bind().await?;
            let config = node_config(&tmp.path().join(format!("f{i}")), &addr, &leader_addr, &[]);
            followers.push(start_on(&config, listener).await?);
            follower_addrs.push(addr);
        }

        let config = node_config(
            &tmp.path().join("leader"),
            &leader_addr,
            &leader_addr,
            &follower_addrs,
        );
        let leader = start_on(&config, leader_listener).await?;
        Ok(Self {
            _tmp: tmp,
            leader,
            followers,
        })
    }

    fn nodes(&self) -> impl Iterator<Item = &RunningNode> {
        std::iter::once(&self.leader).chain(self.followers.iter())
    }

    async fn shutdown(self) -> anyhow::Result<()> {
        self.leader.shutdown().await?;
        for follower in self.followers {
            follower.shutdown().await?;
        }
        Ok(())
    }
}

fn url(node: &RunningNode, path: &str) -> String {
    format!("http://{}{path}", node.local_addr())
}

async fn put(node: &RunningNode, key: &str, value: Value) -> (StatusCode, Value) {
    let res = reqwest::Client::new()
        .put(url(node, &format!("/put/{key}")))
        .json(&json!({ "value": value }))
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

async fn get(node: &RunningNode, key: &str) -> (StatusCode, Value) {
    let res = reqwest::get(url(node, &format!("/get/{key}"))).await.unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

async fn delete(node: &RunningNode, key: &str) -> (StatusCode, Value) {
    let res = reqwest::Client::new()
        .delete(url(node, &format!("/delete/{key}")))
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

#[tokio::test]
async fn put_read_delete_across_the_cluster() -> anyhow::Result<()> {
    let cluster = Cluster::start(2).await?;

    let (status, body) = put(&cluster.leader, "a", json!("1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({"message": "success", "data": {"key": "a", "value": "1"}})
    );

    let (status, body) = get(&cluster.followers[0], "a").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["value"], json!("1"));

    let (status, body) = delete(&cluster.leader, "a").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"message": "success"}));

    for node in cluster.nodes() {
        let (status, body) = get(node, "a").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["message"], "no such key: 'a'");
    }

    cluster.shutdown().await
}

#[tokio::test]
async fn every_peer_has_the_write_before_the_client_sees_success() -> anyhow::Result<()> {
    let cluster = Cluster::start(3).await?;

    let (status, _) = put(&cluster.leader, "k", json!({"nested": [1, 2]})).await;
    assert_eq!(status, StatusCode::OK);

    for follower in &cluster.followers {
        let (status, body) = get(follower, "k").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["value"], json!({"nested": [1, 2]}));
    }

    cluster.shutdown().await
}

#[tokio::test]
async fn writes_sent_to_a_follower_match_writes_sent_to_the_leader() -> anyhow::Result<()> {
    let cluster = Cluster::start(2).await?;

    let (via_leader_status, via_leader) = put(&cluster.leader, "x", json!(7)).await;
    let (via_follower_status, via_follower) = put(&cluster.followers[1], "y", json!(7)).await;
    assert_eq!(via_leader_status, via_follower_status);
    assert_eq!(via_leader["message"], via_follower["message"]);
    assert_eq!(via_leader["data"]["value"], via_follower["data"]["value"]);

    for node in cluster.nodes() {
        for key in ["x", "y"] {
            let (status, body) = get(node, key).await;
            assert_eq!(status, StatusCode::OK, "{key} on {}", node.local_addr());
            assert_eq!(body["data"]["value"], json!(7));
        }
    }

    let (status, _) = delete(&cluster.followers[0], "x").await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = delete(&cluster.followers[0], "x").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");
    for node in cluster.nodes() {
        assert_eq!(get(node, "x").await.0, StatusCode::NOT_FOUND);
    }

    cluster.shutdown().await
}

#[tokio::test]
async fn failing_peer_stops_fan_out_without_rollback() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let (leader_listener, leader_addr) = bind().await?;
    let (first_listener, first_addr) = bind().await?;
    let (last_listener, last_addr) = bind().await?;

    let broken = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/replicate"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&broken)
        .await;

    let first = start_on(
        &node_config(&tmp.path().join("first"), &first_addr, &leader_addr, &[]),
        first_listener,
    )
    .await?;
    let last = start_on(
        &node_config(&tmp.path().join("last"), &last_addr, &leader_addr, &[]),
        last_listener,
    )
    .await?;
    let peers = vec![first_addr.clone(), broken.uri(), last_addr.clone()];
    let leader = start_on(
        &node_config(&tmp.path().join("leader"), &leader_addr, &leader_addr, &peers),
        leader_listener,
    )
    .await?;

    let (status, body) = put(&leader, "a", json!("1")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "replication_failed");
    assert_eq!(body["details"]["applied_peers"], json!([first_addr]));

    assert_eq!(get(&leader, "a").await.0, StatusCode::OK);
    assert_eq!(get(&first, "a").await.0, StatusCode::OK);
    assert_eq!(get(&last, "a").await.0, StatusCode::NOT_FOUND);

    leader.shutdown().await?;
    first.shutdown().await?;
    last.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn restarted_node_serves_its_last_snapshot() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let (listener, addr) = bind().await?;
    let config = node_config(tmp.path(), &addr, &addr, &[]);

    let node = start_on(&config, listener).await?;
    assert_eq!(put(&node, "kept", json!([true, null])).await.0, StatusCode::OK);
    node.shutdown().await?;

    let (listener, addr) = bind().await?;
    let config = node_config(tmp.path(), &addr, &addr, &[]);
    let node = start_on(&config, listener).await?;
    let (status, body) = get(&node, "kept").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["value"], json!([true, null]));
    node.shutdown().await
}
