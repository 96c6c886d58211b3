use notegraph::{
    Error, InsertPosition, OpDispatcher, OpOutput, OpPreset, Operation, Vault, VaultPath,
    VaultService, WriteFormat,
};

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
async fn timestamp_bullet_write_auto_links_entities() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "people/Sarah Mitchell.md", "# Sarah Mitchell\n");
    write(root, "clients/Acme Corp.md", "# Acme Corp\n");
    write(root, "projects/Acme Data Migration.md", "# Acme Data Migration\n");
    write(root, "daily-notes/2026-01-03.md", "## Log\n");

    let service = service_for(root).await?;
    let outcome = service.mutate(|m| {
        m.add_to_section(
            &path("daily-notes/2026-01-03.md"),
            "Log",
            "Call with Sarah at Acme about the data migration.",
            WriteFormat::TimestampBullet,
            InsertPosition::End,
        )
    })?;
    assert_eq!(outcome.applied_links.len(), 3);

    let text = std::fs::read_to_string(root.join("daily-notes/2026-01-03.md"))?;
    let bullet = text
        .lines()
        .find(|l| l.contains("Call with"))
        .expect("bullet appended");
    // Empty section: the bullet lands at the default two-space indent.
    assert!(bullet.starts_with("  - "));
    let clock = &bullet[4..9];
    assert_eq!(&clock[2..3], ":");
    assert!(bullet.ends_with(
        "Call with [[Sarah Mitchell]] at [[Acme Corp]] about the [[Acme Data Migration]]."
    ));

    // The write is reflected in the index synchronously.
    let backlinks = service.with_index(|idx| idx.backlinks_of(&path("clients/Acme Corp.md")));
    assert_eq!(backlinks.len(), 1);
    assert_eq!(backlinks[0].source, path("daily-notes/2026-01-03.md"));
    Ok(())
}

#[tokio::test]
async fn atomic_write_reads_back_exactly() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "note.md", "# Top\nalpha\n");

    let service = service_for(root).await?;
    service.mutate(|m| {
        m.add_to_section(
            &path("note.md"),
            "Top",
            "beta",
            WriteFormat::Plain,
            InsertPosition::End,
        )
    })?;

    let text = std::fs::read_to_string(root.join("note.md"))?;
    // No list item to align with, so the insertion takes the two-space
    // default.
    assert_eq!(text, "# Top\nalpha\n  beta\n");
    Ok(())
}

#[tokio::test]
async fn insertion_into_code_fence_is_a_conflict() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "note.md", "# Code\n```\nlet x = 1;\n");

    let service = service_for(root).await?;
    let err = service
        .mutate(|m| {
            m.add_to_section(
                &path("note.md"),
                "Code",
                "anything",
                WriteFormat::Plain,
                InsertPosition::End,
            )
        })
        .unwrap_err();
    assert!(matches!(err, Error::EditConflict { .. }));
    Ok(())
}

#[tokio::test]
async fn bullet_insertion_matches_deepest_list_indent() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "note.md", "# List\n- one\n  - nested\n");

    let service = service_for(root).await?;
    service.mutate(|m| {
        m.add_to_section(
            &path("note.md"),
            "List",
            "appended",
            WriteFormat::Bullet,
            InsertPosition::End,
        )
    })?;
    let text = std::fs::read_to_string(root.join("note.md"))?;
    assert!(text.ends_with("  - appended\n"));
    Ok(())
}

#[tokio::test]
async fn crlf_notes_keep_their_line_endings() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "win.md", "# Log\r\nfirst\r\n");

    let service = service_for(root).await?;
    service.mutate(|m| {
        m.add_to_section(
            &path("win.md"),
            "Log",
            "second",
            WriteFormat::Plain,
            InsertPosition::End,
        )
    })?;
    let text = std::fs::read_to_string(root.join("win.md"))?;
    assert!(text.contains("second\r\n"));
    Ok(())
}

#[tokio::test]
async fn frontmatter_update_merges_and_rejects_type_changes() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "note.md", "---\nstatus: draft\ntags: [a]\n---\nbody\n");

    let service = service_for(root).await?;
    let mut updates = serde_yaml::Mapping::new();
    updates.insert("status".into(), "final".into());
    updates.insert("owner".into(), "sam".into());
    service.mutate(|m| m.update_frontmatter(&path("note.md"), &updates))?;

    let note = service
        .with_index(|idx| idx.lookup(&path("note.md")).cloned())
        .unwrap();
    assert_eq!(
        note.frontmatter.get("status").and_then(|v| v.as_str()),
        Some("final")
    );
    assert_eq!(
        note.frontmatter.get("owner").and_then(|v| v.as_str()),
        Some("sam")
    );

    // list -> scalar is a type collision
    let mut bad = serde_yaml::Mapping::new();
    bad.insert("tags".into(), "scalar".into());
    let err = service
        .mutate(|m| m.update_frontmatter(&path("note.md"), &bad))
        .unwrap_err();
    assert!(matches!(err, Error::EditConflict { .. }));
    Ok(())
}

#[tokio::test]
async fn delete_warns_about_backlinks_until_forced() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "Target.md", "x\n");
    write(root, "Source.md", "see [[Target]]\n");

    let service = service_for(root).await?;
    let err = service
        .mutate(|m| m.delete_note(&path("Target.md"), false))
        .unwrap_err();
    assert!(matches!(err, Error::DeleteHasBacklinks { count: 1, .. }));

    let outcome = service.mutate(|m| m.delete_note(&path("Target.md"), true))?;
    assert!(outcome.deleted);
    assert_eq!(outcome.backlink_warnings.len(), 1);
    assert!(!root.join("Target.md").exists());

    // The dangling reference is surfaced as a broken link.
    let broken = service.with_index(|idx| {
        idx.broken_link_keys()
            .iter()
            .map(|(k, _)| k.to_string())
            .collect::<Vec<_>>()
    });
    assert!(broken.contains(&"target".to_string()));
    Ok(())
}

#[tokio::test]
async fn toggle_task_flips_the_checkbox() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "todo.md", "# Tasks\n- [ ] write tests\n");

    let service = service_for(root).await?;
    service.mutate(|m| m.toggle_task(&path("todo.md"), 2))?;
    let text = std::fs::read_to_string(root.join("todo.md"))?;
    assert!(text.contains("- [x] write tests"));

    service.mutate(|m| m.toggle_task(&path("todo.md"), 2))?;
    let text = std::fs::read_to_string(root.join("todo.md"))?;
    assert!(text.contains("- [ ] write tests"));
    Ok(())
}

#[tokio::test]
async fn policy_run_is_transactional_per_note() -> anyhow::Result<()> {
    use notegraph::PolicyStep;

    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "daily.md", "## Log\nexisting\n");
    write(root, "other.md", "## Notes\n");

    let service = service_for(root).await?;
    let report = service.mutate(|m| {
        m.run_policy(vec![
            PolicyStep::AddToSection {
                path: path("daily.md"),
                section: "Log".into(),
                content: "first".into(),
                format: WriteFormat::Bullet,
                position: InsertPosition::End,
            },
            // Fails: no such section. The note rolls back to its
            // pre-policy bytes.
            PolicyStep::AddToSection {
                path: path("daily.md"),
                section: "Missing".into(),
                content: "second".into(),
                format: WriteFormat::Bullet,
                position: InsertPosition::End,
            },
            // Skipped: same note already failed.
            PolicyStep::AddToSection {
                path: path("daily.md"),
                section: "Log".into(),
                content: "third".into(),
                format: WriteFormat::Bullet,
                position: InsertPosition::End,
            },
            // Independent note still goes through.
            PolicyStep::AddToSection {
                path: path("other.md"),
                section: "Notes".into(),
                content: "kept".into(),
                format: WriteFormat::Plain,
                position: InsertPosition::End,
            },
        ])
    })?;

    assert!(!report.ok);
    let oks: Vec<bool> = report.steps.iter().map(|s| s.ok).collect();
    assert_eq!(oks, vec![true, false, false, true]);
    assert_eq!(report.rolled_back, vec![path("daily.md")]);

    assert_eq!(
        std::fs::read_to_string(root.join("daily.md"))?,
        "## Log\nexisting\n"
    );
    assert!(std::fs::read_to_string(root.join("other.md"))?.contains("kept"));
    Ok(())
}

#[tokio::test]
async fn create_note_via_dispatcher_round_trips() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "seed.md", "x\n");

    let service = service_for(root).await?;
    let dispatcher = OpDispatcher::new(&service, OpPreset::all());

    let mut fm = serde_yaml::Mapping::new();
    fm.insert("tags".into(), serde_yaml::Value::Sequence(vec!["new".into()]));
    let out = dispatcher.dispatch(Operation::VaultCreateNote {
        path: path("inbox/fresh.md"),
        frontmatter: Some(fm),
        content: "# Fresh\nhello".into(),
    })?;
    assert!(matches!(out, OpOutput::Edit(_)));

    assert!(root.join("inbox/fresh.md").exists());
    assert_eq!(
        service.with_index(|idx| idx.tagged("new").len()),
        1
    );

    // Creating the same path again is a conflict.
    let err = dispatcher
        .dispatch(Operation::VaultCreateNote {
            path: path("inbox/fresh.md"),
            frontmatter: None,
            content: String::new(),
        })
        .unwrap_err();
    assert!(matches!(err, Error::NoteExists(_)));
    Ok(())
}
