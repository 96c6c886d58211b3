use notegraph::{
    Error, ErrorKind, OpDispatcher, OpOutput, OpPreset, Operation, SearchScope, Vault, VaultPath,
    VaultService,
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
async fn content_search_ranks_with_snippets() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(
        root,
        "projects/migration.md",
        "# Data Migration\nWe planned the quarterly data migration with the infra team.\n",
    );
    write(root, "recipes/pasta.md", "# Pasta\nboil water\n");

    let service = service_for(root).await?;
    let dispatcher = OpDispatcher::new(&service, OpPreset::all());
    let out = dispatcher.dispatch(Operation::SearchNotes {
        query: "migration".into(),
        scope: SearchScope::Content,
        tag: None,
        folder: None,
        limit: 10,
    })?;
    let OpOutput::Search(hits) = out else {
        panic!("expected search hits");
    };
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, path("projects/migration.md"));
    assert!(!hits[0].snippet.is_empty());
    Ok(())
}

#[tokio::test]
async fn metadata_and_entity_scopes_match_names() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "people/Sarah Mitchell.md", "---\naliases: [SM]\n---\n");
    write(root, "misc/unrelated.md", "body\n");

    let service = service_for(root).await?;
    let dispatcher = OpDispatcher::new(&service, OpPreset::all());

    let out = dispatcher.dispatch(Operation::SearchNotes {
        query: "sarah".into(),
        scope: SearchScope::Metadata,
        tag: None,
        folder: None,
        limit: 10,
    })?;
    let OpOutput::Search(hits) = out else {
        panic!("expected hits");
    };
    assert_eq!(hits[0].path, path("people/Sarah Mitchell.md"));

    let out = dispatcher.dispatch(Operation::SearchNotes {
        query: "sarah mitchell".into(),
        scope: SearchScope::Entities,
        tag: None,
        folder: None,
        limit: 10,
    })?;
    let OpOutput::Search(hits) = out else {
        panic!("expected hits");
    };
    assert_eq!(hits.len(), 1);
    Ok(())
}

#[tokio::test]
async fn search_filters_by_tag_and_folder() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "a/first.md", "#keep\nshared term alpha\n");
    write(root, "b/second.md", "shared term alpha\n");

    let service = service_for(root).await?;
    let dispatcher = OpDispatcher::new(&service, OpPreset::all());

    let out = dispatcher.dispatch(Operation::SearchNotes {
        query: "alpha".into(),
        scope: SearchScope::Content,
        tag: Some("keep".into()),
        folder: None,
        limit: 10,
    })?;
    let OpOutput::Search(hits) = out else {
        panic!("expected hits");
    };
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, path("a/first.md"));

    let out = dispatcher.dispatch(Operation::SearchNotes {
        query: "alpha".into(),
        scope: SearchScope::Content,
        tag: None,
        folder: Some("b".into()),
        limit: 10,
    })?;
    let OpOutput::Search(hits) = out else {
        panic!("expected hits");
    };
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, path("b/second.md"));
    Ok(())
}

#[tokio::test]
async fn note_metadata_exposes_outline_and_counts() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "B.md", "x\n");
    write(
        root,
        "note.md",
        "---\ntitle: Titled\nstatus: active\n---\n# One\n[[B]]\n## Two\n- [ ] task\n",
    );

    let service = service_for(root).await?;
    let dispatcher = OpDispatcher::new(&service, OpPreset::all());
    let out = dispatcher.dispatch(Operation::GetNoteMetadata {
        path: path("note.md"),
    })?;
    let OpOutput::Metadata(meta) = out else {
        panic!("expected metadata");
    };
    assert_eq!(meta.title, "Titled");
    assert_eq!(meta.outline.len(), 2);
    assert_eq!(meta.outline[0].heading, "One");
    assert_eq!(meta.outlink_count, 1);
    assert_eq!(meta.task_count, 1);
    assert_eq!(
        meta.frontmatter.get("status").and_then(|v| v.as_str()),
        Some("active")
    );
    Ok(())
}

#[tokio::test]
async fn section_content_returns_raw_body() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "note.md", "# A\nalpha line\n# B\nbeta line\n");

    let service = service_for(root).await?;
    let dispatcher = OpDispatcher::new(&service, OpPreset::all());
    let out = dispatcher.dispatch(Operation::GetSectionContent {
        path: path("note.md"),
        section: "A".into(),
    })?;
    assert_eq!(
        out,
        OpOutput::SectionContent {
            content: "alpha line\n".into()
        }
    );
    Ok(())
}

#[tokio::test]
async fn frontmatter_schema_aggregates_types() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "a.md", "---\nstatus: draft\npriority: 1\n---\n");
    write(root, "b.md", "---\nstatus: final\ntags: [x, y]\n---\n");

    let service = service_for(root).await?;
    let dispatcher = OpDispatcher::new(&service, OpPreset::all());
    let out = dispatcher.dispatch(Operation::GetFrontmatterSchema)?;
    let OpOutput::Schema(fields) = out else {
        panic!("expected schema");
    };
    let status = fields.iter().find(|f| f.field == "status").unwrap();
    assert_eq!(status.count, 2);
    assert_eq!(status.types.get("string"), Some(&2));
    let tags = fields.iter().find(|f| f.field == "tags").unwrap();
    assert_eq!(tags.types.get("list"), Some(&1));
    Ok(())
}

#[tokio::test]
async fn stats_and_recent_notes_round_trip() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "a.md", "[[b]]\n");
    write(root, "b.md", "x\n");

    let service = service_for(root).await?;
    let dispatcher = OpDispatcher::new(&service, OpPreset::all());

    let out = dispatcher.dispatch(Operation::GetVaultStats)?;
    let OpOutput::Stats(stats) = out else {
        panic!("expected stats");
    };
    assert_eq!(stats.note_count, 2);
    assert_eq!(stats.link_count, 1);
    assert!(stats.last_snapshot.is_some());

    let out = dispatcher.dispatch(Operation::GetRecentNotes { limit: 1 })?;
    let OpOutput::Recent(recent) = out else {
        panic!("expected recent");
    };
    assert_eq!(recent.len(), 1);
    Ok(())
}

#[tokio::test]
async fn preset_filters_and_readiness_gate_operations() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "a.md", "x\n");

    // Not built yet: reads fail fast with a retryable error.
    let vault = Vault::open(root)?;
    let service = VaultService::new_ephemeral(vault)?;
    let dispatcher = OpDispatcher::new(&service, OpPreset::all());
    let err = dispatcher.dispatch(Operation::GetVaultStats).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotReady);
    assert!(err.is_retryable());

    service.build_index().await?;
    assert!(dispatcher.dispatch(Operation::GetVaultStats).is_ok());

    // A read-only preset refuses mutations by name.
    let read_only = OpDispatcher::new(&service, OpPreset::parse("read")?);
    let err = read_only
        .dispatch(Operation::VaultDeleteNote {
            path: path("a.md"),
            force: true,
        })
        .unwrap_err();
    assert!(matches!(err, Error::UnknownOperation(_)));
    Ok(())
}

#[tokio::test]
async fn export_entities_writes_projection() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "people/Ada Lovelace.md", "---\naliases: [Ada]\n---\n");

    let service = service_for(root).await?;
    let dispatcher = OpDispatcher::new(&service, OpPreset::all());
    let out = dispatcher.dispatch(Operation::ExportEntities)?;
    let OpOutput::Exported { path: file, entities } = out else {
        panic!("expected export");
    };
    assert_eq!(entities, 1);
    let json = std::fs::read_to_string(file)?;
    assert!(json.contains("Ada Lovelace"));
    assert!(json.contains("people/Ada Lovelace.md"));
    Ok(())
}
