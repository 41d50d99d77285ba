//! End-to-end cluster test: four replicas, a gateway, and a user talking
//! real framed TCP on loopback.
//!
//! The five node runtimes are driven round-robin from the test thread via
//! `NodeRuntime::tick`; the blocking user client runs on its own thread
//! and reports back over a channel, so a wedged cluster fails the test at
//! the deadline instead of hanging it.

use std::sync::mpsc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use palisade_config::{ClusterConfig, ClusterSection, NodeEntry, NodeSecrets, Role, encode_key};
use palisade_crypto::{SignatureService, dealer_keygen};
use palisade_node::{NodeError, NodeRuntime, UserClient};
use palisade_store::MemoryStore;
use palisade_types::{NodeId, Timestamp, Username};

const N: usize = 4;
const F: usize = 1;

/// Fixed loopback ports; the offset keeps concurrent test binaries apart.
const BASE_PORT: u16 = 47430;

struct TestCluster {
    config: ClusterConfig,
    secrets: Vec<NodeSecrets>,
}

fn build_cluster(base_port: u16) -> TestCluster {
    let (group_public, shares) = dealer_keygen(N, 2 * F + 1).unwrap();
    let mut nodes = Vec::new();
    let mut secrets = Vec::new();

    for (i, share) in shares.into_iter().enumerate() {
        let (seed, verifying) = SignatureService::generate_keypair();
        nodes.push(NodeEntry {
            id: i as u8,
            role: Role::Replica,
            host: "127.0.0.1".to_string(),
            port: base_port + i as u16,
            verifying_key: encode_key(&verifying),
        });
        secrets.push(NodeSecrets {
            id: i as u8,
            signing_seed: encode_key(&seed),
            threshold_share: Some(encode_key(&share.to_bytes())),
        });
    }

    let (seed, verifying) = SignatureService::generate_keypair();
    nodes.push(NodeEntry {
        id: N as u8,
        role: Role::Gateway,
        host: "127.0.0.1".to_string(),
        port: base_port + N as u16,
        verifying_key: encode_key(&verifying),
    });
    secrets.push(NodeSecrets {
        id: N as u8,
        signing_seed: encode_key(&seed),
        threshold_share: None,
    });

    let config = ClusterConfig {
        cluster: ClusterSection {
            n: N,
            f: F,
            base_port,
            threshold_public_key: encode_key(&group_public),
        },
        nodes,
    };
    config.validate().unwrap();
    TestCluster { config, secrets }
}

fn spawn_runtimes(cluster: &TestCluster) -> Vec<NodeRuntime> {
    let mut runtimes = Vec::new();
    for secrets in &cluster.secrets {
        let runtime = if usize::from(secrets.id) < N {
            NodeRuntime::replica(&cluster.config, secrets, Box::new(MemoryStore::new())).unwrap()
        } else {
            NodeRuntime::gateway(&cluster.config, secrets).unwrap()
        };
        runtimes.push(runtime);
    }
    runtimes
}

fn unique_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64
}

#[test]
fn enroll_then_login_over_loopback() {
    let cluster = build_cluster(BASE_PORT);
    let mut runtimes = spawn_runtimes(&cluster);
    let gateway_addr = format!("127.0.0.1:{}", BASE_PORT + N as u16).parse().unwrap();

    let (report, outcome) = mpsc::channel();
    std::thread::spawn(move || {
        let result = (|| -> Result<([u8; 32], NodeError), NodeError> {
            let user = NodeId::new(N as u8 + 1);
            let username = Username::from("alice");

            // The gateway may not be polling yet; retry the connect.
            let deadline = Instant::now() + Duration::from_secs(10);
            let mut client = loop {
                match UserClient::connect(user, gateway_addr, Duration::from_secs(10)) {
                    Ok(client) => break client,
                    Err(_) if Instant::now() < deadline => {
                        std::thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => return Err(e),
                }
            };

            client.enroll(&username, "correct horse", Timestamp::new(unique_ts()))?;
            let session =
                client.login(&username, "correct horse", Timestamp::new(unique_ts()))?;

            let wrong = client
                .login(&username, "battery staple", Timestamp::new(unique_ts()))
                .expect_err("wrong password must not yield a session");
            Ok((*session.session_key(), wrong))
        })();
        let _ = report.send(result);
    });

    let deadline = Instant::now() + Duration::from_secs(30);
    let result = loop {
        match outcome.try_recv() {
            Ok(result) => break result,
            Err(mpsc::TryRecvError::Empty) => {
                assert!(Instant::now() < deadline, "cluster wedged; no user outcome");
                for runtime in &mut runtimes {
                    runtime.tick(Duration::from_millis(2)).unwrap();
                }
            }
            Err(mpsc::TryRecvError::Disconnected) => panic!("user thread died"),
        }
    };

    let (session_key, wrong_password_error) = result.expect("enroll and login succeed");
    assert_ne!(session_key, [0u8; 32]);
    assert!(matches!(
        wrong_password_error,
        NodeError::ConfirmationFailed
    ));
}
