use notegraph::{CancelToken, Vault, VaultPath, VaultService};

fn write(root: &std::path::Path, rel: &str, content: &str) {
    let p = root.join(rel);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(p, content).unwrap();
}

fn path(s: &str) -> VaultPath {
    VaultPath::try_from(s).unwrap()
}

async fn service_for(root: &std::path::Path) -> anyhow::Result<VaultService> {
    let vault = Vault::open(root)?;
    let service = VaultService::new_ephemeral(vault)?;
    service.build_index().await?;
    Ok(service)
}

#[tokio::test]
async fn rename_rewrites_backlinks_and_keeps_display() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "clients/Acme Corp.md", "# Acme Corp\n");
    write(root, "a.md", "Met [[Acme Corp]] yesterday.\n");
    write(root, "b.md", "Call [[Acme Corp|the client]] back.\n");
    write(root, "c.md", "```\n[[Acme Corp]] stays verbatim\n```\n[[Acme Corp]]\n");

    let service = service_for(root).await?;
    let report = service.mutate(|m| {
        m.rename_note(
            &path("clients/Acme Corp.md"),
            &path("clients/Acme Industries.md"),
            true,
            &CancelToken::new(),
        )
    })?;
    assert!(report.is_complete());
    assert_eq!(report.rewritten.len(), 3);

    assert!(!root.join("clients/Acme Corp.md").exists());
    assert!(root.join("clients/Acme Industries.md").exists());

    let a = std::fs::read_to_string(root.join("a.md"))?;
    assert!(a.contains("[[Acme Industries]]"));
    assert!(!a.contains("Acme Corp"));

    let b = std::fs::read_to_string(root.join("b.md"))?;
    assert!(b.contains("[[Acme Industries|the client]]"));

    // Code fences are preserved verbatim.
    let c = std::fs::read_to_string(root.join("c.md"))?;
    assert!(c.contains("```\n[[Acme Corp]] stays verbatim\n```"));
    assert!(c.ends_with("[[Acme Industries]]\n"));

    // Former backlink set now points at the new path.
    let backlinks =
        service.with_index(|idx| idx.backlinks_of(&path("clients/Acme Industries.md")));
    let sources: Vec<String> = backlinks.iter().map(|b| b.source.to_string()).collect();
    assert_eq!(sources, vec!["a.md", "b.md", "c.md"]);
    Ok(())
}

#[tokio::test]
async fn rename_without_backlink_update_leaves_sources_alone() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "Old.md", "x\n");
    write(root, "ref.md", "[[Old]]\n");

    let service = service_for(root).await?;
    let report = service.mutate(|m| {
        m.rename_note(&path("Old.md"), &path("New.md"), false, &CancelToken::new())
    })?;
    assert!(report.rewritten.is_empty());
    assert_eq!(
        std::fs::read_to_string(root.join("ref.md"))?,
        "[[Old]]\n"
    );
    // The stale reference is now broken.
    let broken = service.with_index(|idx| {
        idx.broken_link_keys()
            .iter()
            .map(|(k, _)| k.to_string())
            .collect::<Vec<_>>()
    });
    assert!(broken.contains(&"old".to_string()));
    Ok(())
}

#[tokio::test]
async fn cancelled_rename_reports_remaining_work() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "T.md", "x\n");
    write(root, "s1.md", "[[T]]\n");
    write(root, "s2.md", "[[T]]\n");

    let service = service_for(root).await?;
    let cancel = CancelToken::new();
    cancel.cancel();
    let report = service.mutate(|m| {
        m.rename_note(&path("T.md"), &path("U.md"), true, &cancel)
    })?;
    // The note itself moved; every rewrite is still pending.
    assert!(root.join("U.md").exists());
    assert_eq!(report.rewritten.len(), 0);
    assert_eq!(report.remaining.len(), 2);
    assert!(!report.is_complete());
    Ok(())
}
