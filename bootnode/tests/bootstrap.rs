use std::future::pending;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tempdir::TempDir;
use tokio::{
    net::UdpSocket,
    sync::Mutex,
    time::{sleep, timeout},
};
use tos_bootnode::{
    bootstrap::{run, DefaultLauncher, DiscoveryMode, EngineLauncher, Outcome, RunningEngine},
    config::{BootnodeConfig, Config},
    discovery::{DiscoveryConfig, DiscoveryResult, NodeIdentity, TopicConfig},
    scion::PathAwareSocket,
    BootnodeError, ErrorKind,
};

fn config(args: &[&str]) -> BootnodeConfig {
    let mut argv = vec!["tos_bootnode"];
    argv.extend_from_slice(args);
    Config::try_parse_from(argv).unwrap().bootnode
}

fn key_hex() -> String {
    NodeIdentity::generate().secret_key().to_hex()
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Started {
    mode: DiscoveryMode,
    announce: SocketAddr,
    alternate_announce: String,
}

/// Starts the real engines and remembers what it was asked to start.
#[derive(Default)]
struct RecordingLauncher {
    started: Mutex<Vec<Started>>,
}

#[async_trait]
impl EngineLauncher for RecordingLauncher {
    async fn start_legacy(
        &self,
        config: DiscoveryConfig,
        primary: Arc<UdpSocket>,
        alternate: Option<Arc<PathAwareSocket>>,
    ) -> DiscoveryResult<Box<dyn RunningEngine>> {
        self.started.lock().await.push(Started {
            mode: DiscoveryMode::Legacy,
            announce: config.announce_addr,
            alternate_announce: config.alternate_announce_addr.clone(),
        });
        DefaultLauncher.start_legacy(config, primary, alternate).await
    }

    async fn start_topic(&self, config: TopicConfig, primary: Arc<UdpSocket>) -> DiscoveryResult<Box<dyn RunningEngine>> {
        self.started.lock().await.push(Started {
            mode: DiscoveryMode::Topic,
            announce: config.announce_addr,
            alternate_announce: String::new(),
        });
        DefaultLauncher.start_topic(config, primary).await
    }
}

#[tokio::test]
async fn test_legacy_mode_serves_until_cancelled() {
    let hex = key_hex();
    let config = config(&["--addr", "127.0.0.1:30301", "--nodekeyhex", &hex]);
    let launcher = RecordingLauncher::default();

    let serve = timeout(Duration::from_millis(800), run(&config, &launcher, pending()));
    let rebind = async {
        sleep(Duration::from_millis(200)).await;
        UdpSocket::bind("127.0.0.1:30301").await
    };
    let (served, rebind) = tokio::join!(serve, rebind);

    assert!(served.is_err(), "run returned before shutdown");
    assert!(rebind.is_err(), "listen port was not bound");
    assert_eq!(
        *launcher.started.lock().await,
        vec![Started {
            mode: DiscoveryMode::Legacy,
            announce: "127.0.0.1:30301".parse().unwrap(),
            alternate_announce: String::new(),
        }]
    );
}

#[tokio::test]
async fn test_topic_mode_shuts_down_on_signal() {
    let hex = key_hex();
    let config = config(&["--addr", "127.0.0.1:30302", "--nodekeyhex", &hex, "--v5"]);
    let launcher = RecordingLauncher::default();

    let outcome = run(&config, &launcher, sleep(Duration::from_millis(200))).await.unwrap();
    assert_eq!(outcome, Outcome::Shutdown);

    let started = launcher.started.lock().await;
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].mode, DiscoveryMode::Topic);
}

#[tokio::test]
async fn test_loopback_with_extip_announces_external_ip() {
    let hex = key_hex();
    let config = config(&["--addr", "127.0.0.1:0", "--nodekeyhex", &hex, "--nat", "extip:203.0.113.9"]);
    let launcher = RecordingLauncher::default();

    run(&config, &launcher, async {}).await.unwrap();

    let started = launcher.started.lock().await;
    assert_eq!(started[0].announce.ip(), "203.0.113.9".parse::<std::net::IpAddr>().unwrap());
    assert_ne!(started[0].announce.port(), 0);
}

#[tokio::test]
async fn test_malformed_alternate_address_aborts_before_binding() {
    let hex = key_hex();
    let config = config(&["--addr", "127.0.0.1:30303", "--nodekeyhex", &hex, "--scion", "1-ff00:0:110,127.0.0.1"]);
    let launcher = RecordingLauncher::default();

    let err = run(&config, &launcher, pending()).await.unwrap_err();
    assert!(matches!(err, BootnodeError::InvalidAlternateAddress(_)), "{}", err);
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().starts_with("--scion: "));

    assert!(launcher.started.lock().await.is_empty());
    UdpSocket::bind("127.0.0.1:30303").await.unwrap();
}

#[tokio::test]
async fn test_invalid_netlist_never_starts_an_engine() {
    let hex = key_hex();
    let config = config(&["--addr", "127.0.0.1:0", "--nodekeyhex", &hex, "--netrestrict", "not-a-cidr"]);
    let launcher = RecordingLauncher::default();

    let err = run(&config, &launcher, pending()).await.unwrap_err();
    assert!(matches!(err, BootnodeError::InvalidNetlist(_)), "{}", err);
    assert!(launcher.started.lock().await.is_empty());
}

#[tokio::test]
async fn test_invalid_nat_descriptor() {
    let hex = key_hex();
    let config = config(&["--addr", "127.0.0.1:0", "--nodekeyhex", &hex, "--nat", "stun"]);
    let err = run(&config, &DefaultLauncher, pending()).await.unwrap_err();
    assert!(matches!(err, BootnodeError::InvalidNatDescriptor(_)), "{}", err);
}

#[tokio::test]
async fn test_identity_source_errors() {
    let err = run(&config(&[]), &DefaultLauncher, pending()).await.unwrap_err();
    assert!(matches!(err, BootnodeError::MissingIdentitySource));

    let hex = key_hex();
    let err = run(&config(&["--nodekey", "node.key", "--nodekeyhex", &hex]), &DefaultLauncher, pending())
        .await
        .unwrap_err();
    assert!(matches!(err, BootnodeError::ConflictingIdentitySource));

    let err = run(&config(&["--nodekeyhex", "abcd"]), &DefaultLauncher, pending())
        .await
        .unwrap_err();
    assert!(matches!(err, BootnodeError::InvalidKeyMaterial { .. }));
}

#[tokio::test]
async fn test_generated_key_matches_written_address() {
    let dir = TempDir::new("tos-bootnode").unwrap();
    let path = dir.path().join("node.key");
    let path_str = path.to_str().unwrap();

    // A bad NAT descriptor does not prevent key generation
    let generated = run(&config(&["--genkey", path_str, "--nat", "bogus"]), &DefaultLauncher, pending())
        .await
        .unwrap();
    let fingerprint = match generated {
        Outcome::KeyGenerated { fingerprint, .. } => fingerprint,
        other => panic!("unexpected {:?}", other),
    };

    let written = run(&config(&["--nodekey", path_str, "--writeaddress"]), &DefaultLauncher, pending())
        .await
        .unwrap();
    assert_eq!(written, Outcome::AddressWritten(fingerprint));
}
