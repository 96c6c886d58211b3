use notegraph::{CancelToken, Vault, VaultIndex, VaultPath};

fn write(root: &std::path::Path, rel: &str, content: &str) {
    let p = root.join(rel);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(p, content).unwrap();
}

fn path(s: &str) -> VaultPath {
    VaultPath::try_from(s).unwrap()
}

#[test]
fn cold_build_indexes_links_tags_and_entities() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "people/Sarah Mitchell.md", "---\naliases: [Sarah]\n---\n#person\n");
    write(root, "daily/2026-01-03.md", "Met [[Sarah Mitchell]] today. #daily\n");
    write(root, ".obsidian/cache.md", "ignored\n");

    let vault = Vault::open(root)?;
    let idx = VaultIndex::build(&vault, &CancelToken::new())?;

    assert_eq!(idx.note_count(), 2);
    assert_eq!(
        idx.resolve("sarah"),
        Some(&path("people/Sarah Mitchell.md"))
    );
    let backlinks = idx.backlinks_of(&path("people/Sarah Mitchell.md"));
    assert_eq!(backlinks.len(), 1);
    assert_eq!(backlinks[0].source, path("daily/2026-01-03.md"));
    assert_eq!(idx.tagged("person").len(), 1);
    Ok(())
}

#[test]
fn outlinks_and_backlinks_stay_in_lockstep() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "A.md", "[[B]] and [[C]]\n");
    write(root, "B.md", "x\n");
    write(root, "C.md", "x\n");

    let vault = Vault::open(root)?;
    let idx = VaultIndex::build(&vault, &CancelToken::new())?;

    for note in idx.all_notes() {
        for link in &note.outlinks {
            let found = idx
                .backlinks(&link.target)
                .iter()
                .any(|b| b.source == note.path && b.line == link.line);
            assert!(found, "missing backlink for {} -> {}", note.path, link.target);
        }
    }
    Ok(())
}

#[test]
fn boundary_files_parse_without_panic() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "empty.md", "");
    write(root, "frontmatter-only.md", "---\ntitle: Only\n---\n");
    write(root, "bad-yaml.md", "---\n: : :\n---\nbody [[Link]]\n");
    write(root, "crlf.md", "---\r\ntitle: Win\r\n---\r\n# H\r\n[[empty]]\r\n");
    write(
        root,
        "nested-fences.md",
        "```\n~~~\n[[hidden]]\n~~~ not closing\n```\n[[visible]]\n",
    );
    write(root, "with space ünicode.md", "# Spaced\n");
    std::fs::write(root.join("binary.md"), [0xffu8, 0xfe, 0x01]).unwrap();

    let vault = Vault::open(root)?;
    let idx = VaultIndex::build(&vault, &CancelToken::new())?;
    assert_eq!(idx.note_count(), 7);

    let empty = idx.lookup(&path("empty.md")).unwrap();
    assert_eq!(empty.warnings, vec!["Empty file"]);
    assert_eq!(empty.title, "empty");

    let bad = idx.lookup(&path("bad-yaml.md")).unwrap();
    assert!(!bad.warnings.is_empty());
    assert_eq!(bad.outlinks.len(), 1);

    let crlf = idx.lookup(&path("crlf.md")).unwrap();
    assert_eq!(crlf.title, "Win");
    assert_eq!(crlf.outlinks.len(), 1);

    let nested = idx.lookup(&path("nested-fences.md")).unwrap();
    let targets: Vec<_> = nested.outlinks.iter().map(|l| l.target.as_str()).collect();
    assert_eq!(targets, vec!["visible"]);

    assert_eq!(
        idx.resolve("with space ünicode"),
        Some(&path("with space ünicode.md"))
    );
    Ok(())
}

#[test]
fn stop_and_date_filenames_never_resolve() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "Me.md", "x\n");
    write(root, "OK.md", "x\n");
    write(root, "2025-01-01.md", "x\n");
    write(root, "2025-W17.md", "x\n");

    let vault = Vault::open(root)?;
    let idx = VaultIndex::build(&vault, &CancelToken::new())?;
    for name in ["me", "ok", "2025-01-01", "2025-W17"] {
        assert_eq!(idx.resolve(name), None, "{name} must not resolve");
    }
    Ok(())
}

#[test]
fn rebuild_from_disk_is_idempotent() -> anyhow::Result<()> {
    let temp = tempfile::tempdir()?;
    let root = temp.path();
    write(root, "a/A.md", "---\ntags: [x]\naliases: [Alpha]\n---\n[[B]]\n# S\n- [ ] t\n");
    write(root, "b/B.md", "[[A]] #y\n");

    let vault = Vault::open(root)?;
    let one = VaultIndex::build(&vault, &CancelToken::new())?;
    let two = VaultIndex::build(&vault, &CancelToken::new())?;
    assert_eq!(one, two);
    Ok(())
}
