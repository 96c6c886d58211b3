use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::{VaultIndex, VaultPath};

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct HubNote {
    pub path: VaultPath,
    pub in_degree: usize,
    /// Log-damped degree, the same figure the suggestion scorer uses.
    pub score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanDirection {
    /// No resolved inbound links.
    Incoming,
    /// No resolved outbound links.
    Outgoing,
    /// Isolated: neither direction.
    Both,
}

pub(crate) fn hub_score(in_degree: usize) -> f64 {
    (1.0 + in_degree as f64).ln()
}

pub fn find_hubs(index: &VaultIndex, top_k: usize) -> Vec<HubNote> {
    let degrees = index.in_degrees();
    let mut out: Vec<HubNote> = degrees
        .into_iter()
        .map(|(path, in_degree)| HubNote {
            path,
            in_degree,
            score: hub_score(in_degree),
        })
        .collect();
    out.sort_by(|a, b| b.in_degree.cmp(&a.in_degree).then_with(|| a.path.cmp(&b.path)));
    out.truncate(top_k);
    out
}

pub fn find_orphans(index: &VaultIndex, direction: OrphanDirection) -> Vec<VaultPath> {
    let degrees = index.in_degrees();
    let mut out: Vec<VaultPath> = index
        .all_notes()
        .filter(|note| {
            let no_in = !degrees.contains_key(&note.path);
            let no_out = !note
                .outlinks
                .iter()
                .any(|l| index.resolve(&l.target).is_some());
            match direction {
                OrphanDirection::Incoming => no_in,
                OrphanDirection::Outgoing => no_out,
                OrphanDirection::Both => no_in && no_out,
            }
        })
        .map(|note| note.path.clone())
        .collect();
    out.sort();
    out
}

/// Breadth-first shortest path over resolved outlinks. With `weighted` set,
/// ties between equally short routes prefer the hop with the higher hub
/// score. Returns the full path including both endpoints, or empty when
/// unreachable.
pub fn shortest_path(
    index: &VaultIndex,
    from: &VaultPath,
    to: &VaultPath,
    weighted: bool,
) -> Vec<VaultPath> {
    if index.lookup(from).is_none() || index.lookup(to).is_none() {
        return Vec::new();
    }
    if from == to {
        return vec![from.clone()];
    }

    let mut forward: HashMap<VaultPath, BTreeSet<VaultPath>> = HashMap::new();
    let mut reverse: HashMap<VaultPath, BTreeSet<VaultPath>> = HashMap::new();
    for note in index.all_notes() {
        for link in &note.outlinks {
            if let Some(target) = index.resolve(&link.target) {
                if target != &note.path {
                    forward
                        .entry(note.path.clone())
                        .or_default()
                        .insert(target.clone());
                    reverse
                        .entry(target.clone())
                        .or_default()
                        .insert(note.path.clone());
                }
            }
        }
    }

    let mut dist: HashMap<VaultPath, usize> = HashMap::new();
    dist.insert(from.clone(), 0);
    let mut queue = VecDeque::new();
    queue.push_back(from.clone());
    while let Some(cur) = queue.pop_front() {
        if &cur == to {
            break;
        }
        let d = dist[&cur];
        if let Some(nexts) = forward.get(&cur) {
            for n in nexts {
                if !dist.contains_key(n) {
                    dist.insert(n.clone(), d + 1);
                    queue.push_back(n.clone());
                }
            }
        }
    }

    let Some(&total) = dist.get(to) else {
        return Vec::new();
    };

    // Walk back from the target, at each step choosing among predecessors
    // one hop closer; hub score breaks ties when weighted.
    let degrees = index.in_degrees();
    let mut path = vec![to.clone()];
    let mut cur = to.clone();
    let mut d = total;
    while d > 0 {
        let Some(preds) = reverse.get(&cur) else {
            return Vec::new();
        };
        let mut best: Option<&VaultPath> = None;
        for p in preds {
            if dist.get(p) != Some(&(d - 1)) {
                continue;
            }
            best = match best {
                None => Some(p),
                Some(b) if weighted => {
                    let pb = degrees.get(b).copied().unwrap_or(0);
                    let pp = degrees.get(p).copied().unwrap_or(0);
                    if pp > pb { Some(p) } else { Some(b) }
                }
                Some(b) => Some(b),
            };
        }
        let Some(best) = best else {
            return Vec::new();
        };
        cur = best.clone();
        path.push(cur.clone());
        d -= 1;
    }
    path.reverse();
    path
}
