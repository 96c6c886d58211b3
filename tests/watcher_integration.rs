use std::time::Duration;

use notegraph::{Vault, VaultConfig, VaultEvent, VaultPath, VaultService};

fn path(s: &str) -> VaultPath {
    VaultPath::try_from(s).unwrap()
}

fn fast_config() -> VaultConfig {
    VaultConfig {
        watch_debounce: Duration::from_millis(100),
        watch_flush_interval: Duration::from_millis(400),
        ..VaultConfig::default()
    }
}

async fn wait_until(
    service: &VaultService,
    deadline: Duration,
    mut check: impl FnMut(&VaultService) -> bool,
) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if check(service) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn watcher_picks_up_created_and_deleted_notes() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path().join("vault");
    std::fs::create_dir_all(&root)?;
    let vault = Vault::with_config(&root, fast_config())?;

    let mut service = VaultService::new_ephemeral(vault)?;
    service.build_index().await?;
    service.start_watching().await?;

    std::fs::write(root.join("fresh.md"), "hello [[world]]\n")?;
    let indexed = wait_until(&service, Duration::from_secs(5), |s| {
        s.with_index(|idx| idx.lookup(&path("fresh.md")).is_some())
    })
    .await;
    assert!(indexed, "created note was not indexed");

    std::fs::remove_file(root.join("fresh.md"))?;
    let removed = wait_until(&service, Duration::from_secs(5), |s| {
        s.with_index(|idx| idx.lookup(&path("fresh.md")).is_none())
    })
    .await;
    assert!(removed, "deleted note was not dropped");

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn rapid_event_storm_coalesces_to_one_upsert() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path().join("vault");
    std::fs::create_dir_all(&root)?;
    let vault = Vault::with_config(&root, fast_config())?;

    let mut service = VaultService::new_ephemeral(vault)?;
    service.build_index().await?;
    service.start_watching().await?;
    let mut events = service.subscribe();

    // add, change, change, unlink, add inside one debounce window.
    let target = root.join("note.md");
    std::fs::write(&target, "one\n")?;
    std::fs::write(&target, "two\n")?;
    std::fs::write(&target, "three\n")?;
    std::fs::remove_file(&target)?;
    std::fs::write(&target, "final\n")?;

    let indexed = wait_until(&service, Duration::from_secs(5), |s| {
        s.with_index(|idx| idx.lookup(&path("note.md")).is_some())
    })
    .await;
    assert!(indexed);

    // Settle, then count what the pipeline actually emitted for the path.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let mut upserts = 0;
    let mut removes = 0;
    while let Ok(ev) = events.try_recv() {
        match ev {
            VaultEvent::Indexed { path: p } if p == path("note.md") => upserts += 1,
            VaultEvent::Removed { path: p } if p == path("note.md") => removes += 1,
            _ => {}
        }
    }
    assert_eq!(upserts, 1, "storm must coalesce into exactly one upsert");
    assert_eq!(removes, 0);

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_is_idempotent() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path().join("vault");
    std::fs::create_dir_all(&root)?;
    let vault = Vault::with_config(&root, fast_config())?;

    let mut service = VaultService::new_ephemeral(vault)?;
    service.build_index().await?;
    service.start_watching().await?;
    service.shutdown().await;
    service.shutdown().await;
    Ok(())
}
