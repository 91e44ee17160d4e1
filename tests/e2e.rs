//! Shoot control plane migration against a local garden with two seeds.
//!
//! Requires a running setup reachable through the default kubeconfig, hence
//! the tests are ignored by default:
//!
//! ```text
//! cargo test --test e2e -- --ignored
//! ```

use gardener::apis::core::Shoot;
use gardener::client::KubeClusterClient;
use gardener::e2e::{self, ShootFramework, ShootMigrationTest};

async fn framework() -> ShootFramework<KubeClusterClient> {
    let client = kube::Client::try_default().await.expect("failed to build garden client");
    ShootFramework::new(KubeClusterClient::new(client))
}

async fn create_migrate_delete(mut shoot: Shoot) {
    let f = framework().await;
    shoot.spec.seed_name = Some(e2e::seed_name(false));

    let created = f.create_shoot_and_wait_for_creation(&shoot).await.unwrap();
    let t = ShootMigrationTest::new(&f, &created, e2e::seed_name(true)).await.unwrap();
    t.migrate_shoot().await.unwrap();
    t.verify_migration().await.unwrap();
    f.delete_shoot_and_wait_for_deletion(&created).await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_migrate_shoot_with_workers() {
    create_migrate_delete(e2e::default_shoot("e2e-migrate")).await;
}

#[tokio::test]
#[ignore]
async fn test_migrate_workerless_shoot() {
    create_migrate_delete(e2e::default_workerless_shoot("e2e-mgr-wl")).await;
}

#[tokio::test]
#[ignore]
async fn test_migrate_hibernated_shoot() {
    create_migrate_delete(e2e::hibernated(e2e::default_shoot("e2e-mgr-hib"))).await;
}
