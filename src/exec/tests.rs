use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::time::timeout;

use super::*;
use crate::{
    client::LocalClient,
    error::Error,
    role::tests::init_tracing,
    wallet::{Account, SimWallet},
    wire::LocalBus,
};

/// Generous bound for a whole run, individual calls use the role timeout.
const RUN_TIMEOUT: Duration = Duration::from_secs(10);

async fn setup(seed: u64) -> (Alice<LocalClient>, Bob<LocalClient>, ExecConfig) {
    let mut rng = StdRng::seed_from_u64(seed);
    let bus = LocalBus::new();

    let alice_id = Account::new(&mut rng);
    let bob_id = Account::new(&mut rng);
    let cfg = ExecConfig::new(
        [alice_id.address(), bob_id.address()],
        rng.gen(),
        [U256::from(100), U256::from(100)],
    );

    let alice_client = LocalClient::connect(alice_id.address(), &bus).await;
    let bob_client = LocalClient::connect(bob_id.address(), &bus).await;
    let alice = Alice::new(
        RoleSetup::new("alice", alice_id, SimWallet),
        alice_client,
        StdRng::seed_from_u64(rng.gen()),
    )
    .unwrap();
    let bob = Bob::new(
        RoleSetup::new("bob", bob_id, SimWallet),
        bob_client,
        StdRng::seed_from_u64(rng.gen()),
    )
    .unwrap();
    (alice, bob, cfg)
}

#[tokio::test]
async fn alice_and_bob_pay_each_other() {
    init_tracing();
    let (mut alice, mut bob, cfg) = setup(0).await;

    timeout(RUN_TIMEOUT, execute_two_party_test(&mut alice, &mut bob, &cfg))
        .await
        .expect("run did not finish")
        .unwrap();

    let ids = alice.role().channels().ids().await;
    assert_eq!(ids.len(), 1);
    assert_eq!(bob.role().channels().ids().await, ids);

    // Alice paid 2 * 5, Bob paid 2 * 3.
    let expected = [U256::from(96), U256::from(104)];
    for ch in [
        alice.role().channels().lookup(&ids[0]).await.unwrap(),
        bob.role().channels().lookup(&ids[0]).await.unwrap(),
    ] {
        let state = ch.state().await;
        assert!(state.is_final);
        assert_eq!(state.version(), 5);
        assert_eq!(state.outcome.balances[0], expected);
    }
}

#[tokio::test]
async fn custom_payments() {
    let (mut alice, mut bob, mut cfg) = setup(1).await;
    cfg.num_payments = [1, 3];
    cfg.tx_amounts = [U256::from(50), U256::from(1)];

    timeout(RUN_TIMEOUT, execute_two_party_test(&mut alice, &mut bob, &cfg))
        .await
        .expect("run did not finish")
        .unwrap();

    let ids = bob.role().channels().ids().await;
    let ch = bob.role().channels().lookup(&ids[0]).await.unwrap();
    assert_eq!(
        ch.state().await.outcome.balances[0],
        [U256::from(53), U256::from(147)]
    );
}

#[tokio::test]
async fn overspending_fails_the_run() {
    let (mut alice, mut bob, mut cfg) = setup(2).await;
    cfg.tx_amounts = [U256::from(60), U256::from(3)];

    let err = timeout(RUN_TIMEOUT, execute_two_party_test(&mut alice, &mut bob, &cfg))
        .await
        .expect("run did not finish")
        .unwrap_err();
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn identity_not_in_peers_is_fatal() {
    let (mut alice, mut bob, mut cfg) = setup(3).await;
    let stranger: Address = StdRng::seed_from_u64(33).gen();
    cfg.peer_addrs[0] = stranger;

    let err = timeout(RUN_TIMEOUT, execute_two_party_test(&mut alice, &mut bob, &cfg))
        .await
        .expect("run did not finish")
        .unwrap_err();
    assert_eq!(
        err,
        Error::Fatal(FatalError::IdentityNotInPeers(alice.role().address()))
    );
}

/// Executer that only takes part in the stages.
struct Idle(Role<LocalClient>);

#[async_trait]
impl Executer for Idle {
    fn enable_stages(&mut self) -> Stages {
        self.0.enable_stages()
    }

    fn set_stages(&mut self, stages: Stages) -> core::result::Result<(), FatalError> {
        self.0.set_stages(stages)
    }

    async fn execute(&mut self, _: &ExecConfig) -> Result<()> {
        while self.0.wait_stage().await.is_ok() {}
        Ok(())
    }
}

#[tokio::test]
async fn stage_count_mismatch_is_fatal() {
    let (mut alice, _, cfg) = setup(4).await;
    let mut rng = StdRng::seed_from_u64(44);
    let identity = Account::new(&mut rng);
    let client = LocalClient::connect(identity.address(), &LocalBus::new()).await;
    let mut idle = Idle(Role::new(
        RoleSetup::new("idle", identity, SimWallet),
        client,
        TWO_PARTY_STAGES - 1,
    )
    .unwrap());

    let err = execute_two_party_test(&mut alice, &mut idle, &cfg)
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(
        err,
        Error::Fatal(FatalError::StageCountMismatch {
            have: TWO_PARTY_STAGES - 1,
            got: TWO_PARTY_STAGES,
        })
    );
}

#[test]
fn config_from_json() {
    let json = r#"{
        "peer_addrs": [
            "0x1111111111111111111111111111111111111111",
            "2222222222222222222222222222222222222222"
        ],
        "asset": { "id": -7 },
        "init_bals": ["100", "100"]
    }"#;
    let cfg: ExecConfig = serde_json::from_str(json).unwrap();

    let expected = ExecConfig::new(
        [Address([0x11; 20]), Address([0x22; 20])],
        SimAsset::new(-7),
        [U256::from(100), U256::from(100)],
    );
    assert_eq!(cfg, expected);
    assert_eq!(cfg.num_payments, [2, 2]);
    assert_eq!(cfg.tx_amounts, [U256::from(5), U256::from(3)]);

    let back: ExecConfig = serde_json::from_str(&serde_json::to_string(&cfg).unwrap()).unwrap();
    assert_eq!(back, cfg);
}
