//! Reply-tree reconstruction from flat remote comment lists.
//!
//! Parent resolution precedence:
//! 1. an explicit reply marker in the body (see [`crate::markers`]);
//! 2. a parent already recorded on the comment;
//! 3. the leading quoted block of the body, matched as a substring of an
//!    earlier comment. The earliest match wins; snippets shorter than
//!    [`MIN_QUOTE_LEN`] characters stay unresolved.
//!
//! Everything here is pure, so running it again over its own output yields the
//! same tree.

use crate::markers;
use crate::tracker::RemoteComment;
use crate::types::{Comment, CommentId};

/// Shortest normalized quote snippet the fallback heuristic will match.
pub const MIN_QUOTE_LEN: usize = 12;

/// Converts a flat remote list into comments with resolved parent linkage.
///
/// Local ids are derived from remote ids; callers that already know a local id
/// for a remote comment remap it afterwards.
pub fn comments_from_remote(remote: &[RemoteComment]) -> Vec<Comment> {
    let mut comments: Vec<Comment> = remote
        .iter()
        .map(|rc| {
            let (text, parent_remote_id) = markers::parse_reply(&rc.body);
            Comment {
                id: CommentId::for_remote_comment(&rc.id),
                author: rc.author.clone(),
                text,
                created_at: rc.created_at,
                remote_id: Some(rc.id.clone()),
                parent_local_id: None,
                parent_remote_id,
                unpushed_edit: false,
            }
        })
        .collect();
    resolve_quoted_parents(&mut comments);
    link_local_parents(&mut comments);
    comments
}

/// Fills `parent_remote_id` for comments without one using the quote
/// heuristic. Comments that already have a parent are left alone.
pub fn resolve_quoted_parents(comments: &mut [Comment]) {
    let order = creation_order(comments);
    let normalized: Vec<String> = comments.iter().map(|c| normalize(&c.text)).collect();

    for (rank, &idx) in order.iter().enumerate() {
        if comments[idx].is_reply() {
            continue;
        }
        let Some(snippet) = leading_quote(&comments[idx].text) else {
            continue;
        };
        if snippet.chars().count() < MIN_QUOTE_LEN {
            continue;
        }
        let parent = order[..rank]
            .iter()
            .copied()
            .find(|&earlier| comments[earlier].remote_id.is_some() && normalized[earlier].contains(&snippet));
        if let Some(parent) = parent {
            let parent_remote = comments[parent].remote_id.clone();
            comments[idx].parent_remote_id = parent_remote;
        }
    }
}

/// Sets `parent_local_id` from `parent_remote_id` wherever the parent is part
/// of the same list.
pub fn link_local_parents(comments: &mut [Comment]) {
    let links: Vec<Option<CommentId>> = comments
        .iter()
        .map(|c| {
            let parent = c.parent_remote_id.as_ref()?;
            comments
                .iter()
                .find(|p| p.remote_id.as_ref() == Some(parent))
                .map(|p| p.id.clone())
        })
        .collect();
    for (comment, link) in comments.iter_mut().zip(links) {
        if let Some(link) = link {
            comment.parent_local_id = Some(link);
        }
    }
}

/// Extracts the leading quoted block (`>` lines, after leading blank lines) in
/// whitespace-normalized form.
fn leading_quote(text: &str) -> Option<String> {
    let quoted: Vec<&str> = text
        .lines()
        .skip_while(|line| line.trim().is_empty())
        .take_while(|line| line.trim_start().starts_with('>'))
        .map(|line| line.trim_start().trim_start_matches('>').trim())
        .collect();
    if quoted.is_empty() {
        return None;
    }
    let snippet = normalize(&quoted.join(" "));
    (!snippet.is_empty()).then_some(snippet)
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Indices sorted by `created_at`, ties broken by list position.
fn creation_order(comments: &[Comment]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..comments.len()).collect();
    order.sort_by_key(|&i| (comments[i].created_at, i));
    order
}

/// One node of a display tree.
#[derive(Debug)]
pub struct CommentNode<'a> {
    pub comment: &'a Comment,
    pub children: Vec<CommentNode<'a>>,
}

/// Builds the display tree: roots and every child list are sorted by
/// `created_at` independently.
///
/// Comments whose parent is missing, or that sit on a parent cycle, are
/// promoted to roots.
pub fn build_tree(comments: &[Comment]) -> Vec<CommentNode<'_>> {
    let mut parent_of: Vec<Option<usize>> = comments
        .iter()
        .enumerate()
        .map(|(i, c)| find_parent(comments, c).filter(|&p| p != i))
        .collect();
    break_cycles(&mut parent_of);

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); comments.len()];
    let mut roots = Vec::new();
    for (i, parent) in parent_of.iter().enumerate() {
        match parent {
            Some(p) => children[*p].push(i),
            None => roots.push(i),
        }
    }
    assemble(comments, &children, roots)
}

fn find_parent(comments: &[Comment], comment: &Comment) -> Option<usize> {
    if let Some(local) = &comment.parent_local_id {
        if let Some(idx) = comments.iter().position(|c| &c.id == local) {
            return Some(idx);
        }
    }
    let remote = comment.parent_remote_id.as_ref()?;
    comments
        .iter()
        .position(|c| c.remote_id.as_ref() == Some(remote))
}

fn break_cycles(parent_of: &mut [Option<usize>]) {
    let n = parent_of.len();
    for start in 0..n {
        let mut cursor = parent_of[start];
        let mut steps = 0;
        while let Some(next) = cursor {
            if next == start {
                parent_of[start] = None;
                break;
            }
            steps += 1;
            if steps > n {
                break;
            }
            cursor = parent_of[next];
        }
    }
}

fn assemble<'a>(
    comments: &'a [Comment],
    children: &[Vec<usize>],
    mut level: Vec<usize>,
) -> Vec<CommentNode<'a>> {
    level.sort_by_key(|&i| (comments[i].created_at, i));
    level
        .into_iter()
        .map(|i| CommentNode {
            comment: &comments[i],
            children: assemble(comments, children, children[i].clone()),
        })
        .collect()
}

/// Depth-first flattening of a display tree into `(depth, comment)` rows.
pub fn flatten<'a>(nodes: &[CommentNode<'a>]) -> Vec<(usize, &'a Comment)> {
    fn walk<'a>(nodes: &[CommentNode<'a>], depth: usize, out: &mut Vec<(usize, &'a Comment)>) {
        for node in nodes {
            out.push((depth, node.comment));
            walk(&node.children, depth + 1, out);
        }
    }
    let mut out = Vec::new();
    walk(nodes, 0, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::types::RemoteId;

    fn remote(id: &str, minute: i64, body: &str) -> RemoteComment {
        RemoteComment {
            id: RemoteId::from(id),
            author: Some("octo".to_owned()),
            body: body.to_owned(),
            created_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::minutes(minute),
        }
    }

    #[test]
    fn marker_takes_precedence_over_quote() {
        let list = vec![
            remote("1", 0, "the header overlaps the logo"),
            remote("2", 1, "agreed, fixing"),
            remote(
                "3",
                2,
                "> the header overlaps the logo\nsee above\n\n<!-- pinthread:reply-to=2 -->",
            ),
        ];
        let comments = comments_from_remote(&list);
        assert_eq!(comments[2].parent_remote_id, Some(RemoteId::from("2")));
        assert!(!comments[2].text.contains("pinthread"));
    }

    #[test]
    fn quoted_block_links_to_earliest_matching_comment() {
        let list = vec![
            remote("1", 0, "the header overlaps the logo on mobile"),
            remote("2", 1, "also on tablet: the header overlaps the logo"),
            remote("3", 2, "> the header overlaps the logo\n\nwill look at it"),
        ];
        let comments = comments_from_remote(&list);
        assert_eq!(comments[2].parent_remote_id, Some(RemoteId::from("1")));
        assert_eq!(comments[2].parent_local_id, Some(comments[0].id.clone()));
    }

    #[test]
    fn short_or_unmatched_quotes_stay_top_level() {
        let list = vec![
            remote("1", 0, "button is misaligned"),
            remote("2", 1, "> ok\nthanks"),
            remote("3", 2, "> something nobody said before\nhm"),
        ];
        let comments = comments_from_remote(&list);
        assert!(comments[1].parent_remote_id.is_none());
        assert!(comments[2].parent_remote_id.is_none());
    }

    #[test]
    fn quotes_only_match_earlier_comments() {
        let list = vec![
            remote("1", 5, "> the footer links are broken\nreplying early"),
            remote("2", 0, "the footer links are broken everywhere"),
        ];
        let comments = comments_from_remote(&list);
        assert_eq!(comments[0].parent_remote_id, Some(RemoteId::from("2")));
        assert!(comments[1].parent_remote_id.is_none());
    }

    #[test]
    fn resolution_is_idempotent() {
        let list = vec![
            remote("1", 0, "the header overlaps the logo on mobile"),
            remote("2", 1, "> the header overlaps the logo\nyes"),
            remote("3", 2, "reply\n<!-- pinthread:reply-to=2 -->"),
        ];
        let first = comments_from_remote(&list);
        let mut second = first.clone();
        resolve_quoted_parents(&mut second);
        link_local_parents(&mut second);
        assert_eq!(first, second);
    }

    #[test]
    fn tree_levels_are_sorted_independently() {
        let list = vec![
            remote("10", 3, "late root"),
            remote("11", 0, "early root"),
            remote("12", 4, "second reply\n<!-- pinthread:reply-to=11 -->"),
            remote("13", 1, "first reply\n<!-- pinthread:reply-to=11 -->"),
        ];
        let comments = comments_from_remote(&list);
        let tree = build_tree(&comments);
        let roots: Vec<&str> = tree.iter().map(|n| n.comment.text.as_str()).collect();
        assert_eq!(roots, vec!["early root", "late root"]);
        let replies: Vec<&str> = tree[0].children.iter().map(|n| n.comment.text.as_str()).collect();
        assert_eq!(replies, vec!["first reply", "second reply"]);

        let rows: Vec<(usize, &str)> = flatten(&tree)
            .into_iter()
            .map(|(depth, c)| (depth, c.text.as_str()))
            .collect();
        assert_eq!(
            rows,
            vec![(0, "early root"), (1, "first reply"), (1, "second reply"), (0, "late root")]
        );
    }

    #[test]
    fn parent_cycles_do_not_hide_comments() {
        let list = vec![
            remote("1", 0, "a\n<!-- pinthread:reply-to=2 -->"),
            remote("2", 1, "b\n<!-- pinthread:reply-to=1 -->"),
        ];
        let comments = comments_from_remote(&list);
        let tree = build_tree(&comments);
        assert_eq!(flatten(&tree).len(), 2);
    }
}
