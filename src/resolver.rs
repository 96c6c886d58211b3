use std::collections::{BTreeSet, HashMap};
use std::time::SystemTime;

use crate::feedback::FeedbackSnapshot;
use crate::index::{is_date_like, is_stop_entity, is_valid_entity_name};
use crate::parse::{body_start, mask_inline_code, FenceTracker};
use crate::{CooccurrenceWindow, Entity, VaultConfig, VaultIndex, VaultPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SurfaceKind {
    Name,
    Alias,
}

#[derive(Debug, Clone)]
struct SurfaceRef {
    path: VaultPath,
    kind: SurfaceKind,
}

#[derive(Debug, Default)]
struct TrieNode {
    children: HashMap<String, TrieNode>,
    terminals: Vec<SurfaceRef>,
}

/// A free-text span that matched at least one entity surface.
#[derive(Debug, Clone)]
pub struct SpanMatch {
    /// Byte range in the full note text.
    pub start: usize,
    pub end: usize,
    /// 1-based line of the span.
    pub line: u32,
    /// Original text of the span, casing preserved.
    pub surface: String,
    candidates: Vec<SurfaceRef>,
}

/// Per-layer contributions of the suggestion score, in evaluation order.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct ScoreBreakdown {
    pub exact_surface: f64,
    pub alias: f64,
    pub proximity: f64,
    pub folder_affinity: f64,
    pub cooccurrence: f64,
    pub hub: f64,
    pub recency: f64,
    pub folder_prior: f64,
    pub accuracy_tier: f64,
    pub suppressed: bool,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ScoredCandidate {
    pub path: VaultPath,
    pub name: String,
    pub breakdown: ScoreBreakdown,
}

/// One span with its winning entity and runner-up suggestions.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SpanResolution {
    pub surface: String,
    pub line: u32,
    pub start: usize,
    pub end: usize,
    pub winner: ScoredCandidate,
    pub alternates: Vec<ScoredCandidate>,
}

/// An auto-link rewrite decided by the application policy.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AppliedLink {
    pub entity_path: VaultPath,
    pub entity_name: String,
    pub surface: String,
    pub line: u32,
}

/// Everything the pure scorer needs, frozen at call time.
pub struct ScoreContext<'a> {
    pub index: &'a VaultIndex,
    pub feedback: &'a FeedbackSnapshot,
    pub cooccurrence: &'a CooccurrenceCounts,
    pub degrees: &'a HashMap<VaultPath, usize>,
    pub dest_folder: &'a str,
    /// Entities already referenced by the destination note.
    pub dest_entities: &'a BTreeSet<VaultPath>,
    pub now: SystemTime,
}

/// Pair counts of entities appearing in the same window anywhere in the
/// vault. Pairs are stored with the smaller path first.
#[derive(Debug, Clone, Default)]
pub struct CooccurrenceCounts {
    pairs: HashMap<(VaultPath, VaultPath), u32>,
}

impl CooccurrenceCounts {
    pub fn build(index: &VaultIndex, window: CooccurrenceWindow) -> Self {
        let mut pairs: HashMap<(VaultPath, VaultPath), u32> = HashMap::new();
        for note in index.all_notes() {
            let resolved: Vec<(u32, VaultPath)> = note
                .outlinks
                .iter()
                .filter_map(|l| index.resolve(&l.target).map(|p| (l.line, p.clone())))
                .collect();
            for group in group_by_window(note, &resolved, window) {
                let mut uniq: Vec<&VaultPath> = group.iter().collect();
                uniq.sort();
                uniq.dedup();
                for i in 0..uniq.len() {
                    for j in i + 1..uniq.len() {
                        let key = if uniq[i] <= uniq[j] {
                            (uniq[i].clone(), uniq[j].clone())
                        } else {
                            (uniq[j].clone(), uniq[i].clone())
                        };
                        *pairs.entry(key).or_default() += 1;
                    }
                }
            }
        }
        Self { pairs }
    }

    pub fn count(&self, a: &VaultPath, b: &VaultPath) -> u32 {
        let key = if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        };
        self.pairs.get(&key).copied().unwrap_or(0)
    }
}

fn group_by_window(
    note: &crate::Note,
    resolved: &[(u32, VaultPath)],
    window: CooccurrenceWindow,
) -> Vec<Vec<VaultPath>> {
    match window {
        CooccurrenceWindow::Note => {
            vec![resolved.iter().map(|(_, p)| p.clone()).collect()]
        }
        CooccurrenceWindow::Section => {
            let mut groups: HashMap<usize, Vec<VaultPath>> = HashMap::new();
            for (line, path) in resolved {
                // Deepest section whose line span contains the link;
                // links before any heading share the preamble group.
                let ix = note
                    .sections
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| *line > s.heading_line && *line < s.end_line)
                    .max_by_key(|(_, s)| s.level)
                    .map(|(ix, _)| ix + 1)
                    .unwrap_or(0);
                groups.entry(ix).or_default().push(path.clone());
            }
            groups.into_values().collect()
        }
        CooccurrenceWindow::Paragraph => {
            // Approximated by line clusters: a gap of more than two lines
            // starts a new group.
            let mut sorted: Vec<(u32, VaultPath)> = resolved.to_vec();
            sorted.sort();
            let mut out: Vec<Vec<VaultPath>> = Vec::new();
            let mut last_line = 0u32;
            for (line, path) in sorted {
                if out.is_empty() || line.saturating_sub(last_line) > 2 {
                    out.push(Vec::new());
                }
                if let Some(group) = out.last_mut() {
                    group.push(path);
                }
                last_line = line;
            }
            out
        }
    }
}

/// Matches free-text spans against entity surfaces via token tries;
/// longest match wins, case-insensitively, never inside code or existing
/// links.
///
/// Three match shapes feed the scorer: exact surfaces (name or alias),
/// leading-token prefixes ("Sarah" against "Sarah Mitchell"), and trailing
/// token runs ("data migration" against "Acme Data Migration"). The
/// proximity layer grades the partial shapes down.
pub struct EntityResolver {
    root: TrieNode,
    /// Proper token-suffixes of every surface; terminal-only matches.
    suffix_root: TrieNode,
    max_tokens: usize,
}

const MAX_PREFIX_CANDIDATES: usize = 8;

impl EntityResolver {
    pub fn new(index: &VaultIndex) -> Self {
        let mut root = TrieNode::default();
        let mut suffix_root = TrieNode::default();
        let mut max_tokens = 1;

        let mut add = |root: &mut TrieNode,
                       suffix_root: &mut TrieNode,
                       surface: &str,
                       re: SurfaceRef| {
            let tokens = tokenize(surface);
            if tokens.is_empty() {
                return 0;
            }
            insert_tokens(root, &tokens, re.clone());
            for skip in 1..tokens.len() {
                insert_tokens(suffix_root, &tokens[skip..], re.clone());
            }
            tokens.len()
        };

        for entity in index.entities() {
            if is_valid_entity_name(&entity.name) {
                max_tokens = max_tokens.max(add(
                    &mut root,
                    &mut suffix_root,
                    &entity.name,
                    SurfaceRef {
                        path: entity.path.clone(),
                        kind: SurfaceKind::Name,
                    },
                ));
            }
            for alias in &entity.aliases {
                if is_valid_entity_name(alias) {
                    max_tokens = max_tokens.max(add(
                        &mut root,
                        &mut suffix_root,
                        alias,
                        SurfaceRef {
                            path: entity.path.clone(),
                            kind: SurfaceKind::Alias,
                        },
                    ));
                }
            }
        }
        Self {
            root,
            suffix_root,
            max_tokens,
        }
    }

    /// Entities whose name or alias equals the span exactly, case-folded.
    pub fn resolve_span(&self, span: &str) -> Vec<&VaultPath> {
        if !span_passes_stop_filter(span) {
            return Vec::new();
        }
        let tokens = tokenize(span);
        let mut node = &self.root;
        for (tok, _, _) in &tokens {
            match node.children.get(tok) {
                Some(next) => node = next,
                None => return Vec::new(),
            }
        }
        node.terminals.iter().map(|t| &t.path).collect()
    }

    /// Scan the full note text for entity spans. Frontmatter, fenced code,
    /// inline code and existing wikilinks are never matched.
    pub fn find_spans(&self, content: &str) -> Vec<SpanMatch> {
        let (body_offset, body_line) = body_start(content);
        let body = &content[body_offset..];

        let mut out = Vec::new();
        let mut fences = FenceTracker::default();
        let mut offset = body_offset;
        let mut line_no = body_line;

        for line in body.split_inclusive('\n') {
            let stripped = line.trim_end_matches(['\n', '\r']);
            if fences.observe(stripped) || fences.in_fence() {
                offset += line.len();
                line_no += 1;
                continue;
            }

            let masked = mask_links(&mask_inline_code(stripped));
            let tokens = tokenize(&masked);
            let mut i = 0usize;
            while i < tokens.len() {
                if let Some((j, candidates)) = self.match_at(&tokens, i) {
                    let span_start = tokens[i].1;
                    let span_end = tokens[j].2;
                    let surface = stripped[span_start..span_end].to_string();
                    if span_passes_stop_filter(&surface) {
                        out.push(SpanMatch {
                            start: offset + span_start,
                            end: offset + span_end,
                            line: line_no,
                            surface,
                            candidates,
                        });
                        i = j + 1;
                        continue;
                    }
                }
                i += 1;
            }

            offset += line.len();
            line_no += 1;
        }
        out
    }

    /// Longest span starting at token `i`: exact terminals and prefix
    /// descent in the main trie, terminal suffix runs in the suffix trie.
    /// Candidates of every shape achieving the longest span are merged.
    fn match_at(
        &self,
        tokens: &[(String, usize, usize)],
        i: usize,
    ) -> Option<(usize, Vec<SurfaceRef>)> {
        let limit = (i + self.max_tokens).min(tokens.len());

        let mut node = &self.root;
        let mut exact: Option<(usize, &TrieNode)> = None;
        let mut deepest: Option<(usize, &TrieNode)> = None;
        for (j, (tok, _, _)) in tokens.iter().enumerate().take(limit).skip(i) {
            match node.children.get(tok) {
                Some(next) => {
                    node = next;
                    deepest = Some((j, node));
                    if !node.terminals.is_empty() {
                        exact = Some((j, node));
                    }
                }
                None => break,
            }
        }

        let mut suffix_node = &self.suffix_root;
        let mut suffix: Option<(usize, &TrieNode)> = None;
        for (j, (tok, _, _)) in tokens.iter().enumerate().take(limit).skip(i) {
            match suffix_node.children.get(tok) {
                Some(next) => {
                    suffix_node = next;
                    if !next.terminals.is_empty() {
                        suffix = Some((j, next));
                    }
                }
                None => break,
            }
        }

        let end = [
            exact.map(|(j, _)| j),
            deepest.map(|(j, _)| j),
            suffix.map(|(j, _)| j),
        ]
        .into_iter()
        .flatten()
        .max()?;

        let mut candidates: Vec<SurfaceRef> = Vec::new();
        if let Some((j, node)) = exact {
            if j == end {
                candidates.extend(node.terminals.iter().cloned());
            }
        }
        if let Some((j, node)) = suffix {
            if j == end {
                candidates.extend(node.terminals.iter().cloned());
            }
        }
        if let Some((j, node)) = deepest {
            if j == end {
                collect_subtree(node, &mut candidates, MAX_PREFIX_CANDIDATES);
            }
        }
        candidates.dedup_by(|a, b| a.path == b.path);
        let mut seen = Vec::new();
        candidates.retain(|c| {
            if seen.contains(&c.path) {
                false
            } else {
                seen.push(c.path.clone());
                true
            }
        });
        if candidates.is_empty() {
            None
        } else {
            Some((end, candidates))
        }
    }
}

fn insert_tokens(root: &mut TrieNode, tokens: &[(String, usize, usize)], re: SurfaceRef) {
    let mut node = root;
    for (tok, _, _) in tokens {
        node = node.children.entry(tok.clone()).or_default();
    }
    if !node
        .terminals
        .iter()
        .any(|t| t.path == re.path && t.kind == re.kind)
    {
        node.terminals.push(re);
    }
}

fn collect_subtree(node: &TrieNode, out: &mut Vec<SurfaceRef>, cap: usize) {
    if out.len() >= cap {
        return;
    }
    out.extend(node.terminals.iter().cloned());
    let mut keys: Vec<&String> = node.children.keys().collect();
    keys.sort();
    for key in keys {
        if out.len() >= cap {
            return;
        }
        collect_subtree(&node.children[key], out, cap);
    }
}

/// Lowercased word tokens with byte offsets.
fn tokenize(text: &str) -> Vec<(String, usize, usize)> {
    let mut out = Vec::new();
    let mut start: Option<usize> = None;
    for (ix, ch) in text.char_indices() {
        if ch.is_alphanumeric() {
            if start.is_none() {
                start = Some(ix);
            }
        } else if let Some(s) = start.take() {
            out.push((text[s..ix].to_lowercase(), s, ix));
        }
    }
    if let Some(s) = start {
        out.push((text[s..].to_lowercase(), s, text.len()));
    }
    out
}

/// Blank out `[[...]]` spans so their contents are never re-matched.
fn mask_links(line: &str) -> String {
    let bytes = line.as_bytes();
    let mut out = bytes.to_vec();
    let mut i = 0usize;
    while i + 1 < bytes.len() {
        if bytes[i] == b'[' && bytes[i + 1] == b'[' {
            let mut j = i + 2;
            while j + 1 < bytes.len() && !(bytes[j] == b']' && bytes[j + 1] == b']') {
                j += 1;
            }
            if j + 1 < bytes.len() {
                for b in out.iter_mut().take(j + 2).skip(i) {
                    if b.is_ascii() {
                        *b = b' ';
                    }
                }
                i = j + 2;
                continue;
            }
        }
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| line.to_string())
}

fn span_passes_stop_filter(span: &str) -> bool {
    let span = span.trim();
    span.chars().count() >= 2 && !is_stop_entity(span) && !is_date_like(span)
}

/// Sum the ten scoring layers for one candidate. Pure: same inputs, same
/// breakdown.
pub fn score_candidate(surface: &str, entity: &Entity, ctx: &ScoreContext<'_>) -> ScoreBreakdown {
    let mut b = ScoreBreakdown::default();

    if ctx.feedback.is_suppressed(&entity.name, ctx.dest_folder) {
        b.suppressed = true;
        return b;
    }

    let surface_lower = surface.trim().to_lowercase();
    let name_lower = entity.name.to_lowercase();

    if surface_lower == name_lower {
        b.exact_surface = 10.0;
    }
    if entity
        .aliases
        .iter()
        .any(|a| a.to_lowercase() == surface_lower)
    {
        b.alias = 7.0;
    }
    if b.exact_surface == 0.0 && b.alias == 0.0 {
        b.proximity = proximity(&surface_lower, &name_lower);
    }

    let folder = entity.path.folder();
    b.folder_affinity = if folder == ctx.dest_folder {
        2.0
    } else if top_level(folder) != top_level(ctx.dest_folder) {
        -2.0
    } else {
        0.0
    };

    let mut cooc = 0u32;
    for present in ctx.dest_entities {
        if present != &entity.path {
            cooc += ctx.cooccurrence.count(present, &entity.path);
        }
    }
    b.cooccurrence = f64::from(cooc).min(5.0);

    let degree = ctx.degrees.get(&entity.path).copied().unwrap_or(0);
    b.hub = crate::graph::hub_score(degree).min(3.0);

    if let Some(note) = ctx.index.lookup(&entity.path) {
        if let Ok(age) = ctx.now.duration_since(note.mtime) {
            b.recency = if age.as_secs() < 7 * 86_400 {
                2.0
            } else if age.as_secs() < 30 * 86_400 {
                1.0
            } else {
                0.0
            };
        }
    }

    b.folder_prior = match ctx.feedback.accuracy_in(&entity.name, ctx.dest_folder) {
        Some(acc) => ((acc - 0.5) * 6.0).clamp(-3.0, 3.0),
        None => 0.0,
    };

    b.accuracy_tier = match ctx.feedback.global_accuracy(&entity.name) {
        Some(acc) if acc >= 0.95 => 5.0,
        Some(acc) if acc >= 0.80 => 2.0,
        Some(acc) if acc >= 0.60 => 0.0,
        Some(acc) if acc >= 0.40 => -2.0,
        Some(_) => -4.0,
        None => 0.0,
    };

    b.total = b.exact_surface
        + b.alias
        + b.proximity
        + b.folder_affinity
        + b.cooccurrence
        + b.hub
        + b.recency
        + b.folder_prior
        + b.accuracy_tier;
    b
}

/// Prefix/substring closeness of the span to the canonical name, 0..3,
/// graded by the share of name tokens the span covers.
fn proximity(surface: &str, name: &str) -> f64 {
    let s: Vec<String> = tokenize(surface).into_iter().map(|t| t.0).collect();
    let n: Vec<String> = tokenize(name).into_iter().map(|t| t.0).collect();
    if s.is_empty() || n.is_empty() || s.len() >= n.len() {
        return 0.0;
    }
    let ratio = s.len() as f64 / n.len() as f64;
    if n.starts_with(&s[..]) {
        3.0 * ratio
    } else if n.windows(s.len()).any(|w| w == s.as_slice()) {
        2.5 * ratio
    } else {
        0.0
    }
}

fn top_level(folder: &str) -> &str {
    folder.split('/').next().unwrap_or("")
}

/// Resolve every span in `content`, returning the winner and the next two
/// candidates per span. Suppressed candidates are excluded outright.
pub fn resolve_spans(
    resolver: &EntityResolver,
    content: &str,
    dest: &VaultPath,
    ctx: &ScoreContext<'_>,
) -> Vec<SpanResolution> {
    let mut out = Vec::new();
    for span in resolver.find_spans(content) {
        let mut scored: Vec<ScoredCandidate> = Vec::new();
        for cand in &span.candidates {
            if &cand.path == dest {
                continue;
            }
            let Some(entity) = ctx.index.entity(&cand.path) else {
                continue;
            };
            let breakdown = score_candidate(&span.surface, entity, ctx);
            if breakdown.suppressed {
                continue;
            }
            scored.push(ScoredCandidate {
                path: cand.path.clone(),
                name: entity.name.clone(),
                breakdown,
            });
        }
        if scored.is_empty() {
            continue;
        }
        sort_candidates(&mut scored, ctx);
        let winner = scored.remove(0);
        scored.truncate(2);
        out.push(SpanResolution {
            surface: span.surface,
            line: span.line,
            start: span.start,
            end: span.end,
            winner,
            alternates: scored,
        });
    }
    out
}

/// Tie order: score, destination-folder match, shorter name, earlier
/// insertion.
fn sort_candidates(scored: &mut [ScoredCandidate], ctx: &ScoreContext<'_>) {
    scored.sort_by(|a, b| {
        b.breakdown
            .total
            .partial_cmp(&a.breakdown.total)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let af = a.path.folder() == ctx.dest_folder;
                let bf = b.path.folder() == ctx.dest_folder;
                bf.cmp(&af)
            })
            .then_with(|| a.name.len().cmp(&b.name.len()))
            .then_with(|| {
                let ao = ctx.index.entity(&a.path).map(|e| e.order).unwrap_or(u64::MAX);
                let bo = ctx.index.entity(&b.path).map(|e| e.order).unwrap_or(u64::MAX);
                ao.cmp(&bo)
            })
    });
}

/// Application policy: rewrite spans whose winner clears the floor into
/// wikilinks. Text inside code fences and existing links is untouched.
pub fn apply_autolinks(
    resolver: &EntityResolver,
    content: &str,
    dest: &VaultPath,
    ctx: &ScoreContext<'_>,
    cfg: &VaultConfig,
) -> (String, Vec<AppliedLink>) {
    let resolutions = resolve_spans(resolver, content, dest, ctx);
    let mut applied = Vec::new();
    let mut out = content.to_string();

    // Rewrite back-to-front so earlier offsets stay valid.
    for res in resolutions.iter().rev() {
        if res.winner.breakdown.total < cfg.autolink_floor {
            continue;
        }
        // Case-only differences collapse to the canonical name; declared
        // aliases keep the written surface as the display; partial matches
        // expand to the canonical name.
        let name = &res.winner.name;
        let replacement = if res.surface.to_lowercase() == name.to_lowercase() {
            format!("[[{name}]]")
        } else if res.winner.breakdown.alias > 0.0 {
            format!("[[{name}|{}]]", res.surface)
        } else {
            format!("[[{name}]]")
        };
        out.replace_range(res.start..res.end, &replacement);
        applied.push(AppliedLink {
            entity_path: res.winner.path.clone(),
            entity_name: name.clone(),
            surface: res.surface.clone(),
            line: res.line,
        });
    }
    applied.reverse();
    (out, applied)
}
