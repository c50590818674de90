//! Three-way merge engine.
//!
//! Line-based diff3: `base -> ours` and `base -> theirs` are diffed with
//! `similar` (Myers), the two edit scripts are walked together over base line
//! indices, and every region touched by only one side takes that side's text.
//! Regions changed by both sides resolve when both produced identical text
//! and otherwise become a [`MergeConflict`] carrying the three versions
//! verbatim; rendering conflict markers is left to the caller.
//!
//! Unified diffs for display are produced with `diffy`.

use serde::{Deserialize, Serialize};
use similar::{Algorithm, DiffTag};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Input to [`Merger::merge`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub file_path: String,
    pub base: String,
    pub ours: String,
    pub theirs: String,
}

/// One region both sides changed differently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeConflict {
    /// 1-based first base line of the region. For a pure insertion this is
    /// the line the text would be inserted before.
    pub start_line: usize,
    /// 1-based last base line of the region (equal to `start_line` for a pure
    /// insertion).
    pub end_line: usize,
    pub base: String,
    pub ours: String,
    pub theirs: String,
}

/// Line counts describing a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub base_lines: usize,
    pub ours_lines: usize,
    pub theirs_lines: usize,
    pub merged_lines: usize,
    /// Number of changed regions on our side.
    pub ours_changes: usize,
    /// Number of changed regions on their side.
    pub theirs_changes: usize,
    pub conflict_count: usize,
}

/// The result of a three-way merge attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    /// The merge completed and `merged` holds the result.
    pub success: bool,
    /// Merged text; present only when no changed region overlaps.
    pub merged: Option<String>,
    pub has_conflicts: bool,
    pub conflicts: Vec<MergeConflict>,
    pub stats: MergeStats,
    /// Why the merge could not be attempted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MergeResult {
    fn clean(merged: String, base: &[&str], ours: &[&str], theirs: &[&str]) -> Self {
        let merged_lines = count_lines(&merged);
        Self {
            success: true,
            merged: Some(merged),
            has_conflicts: false,
            conflicts: Vec::new(),
            stats: MergeStats {
                base_lines: base.len(),
                ours_lines: ours.len(),
                theirs_lines: theirs.len(),
                merged_lines,
                ..MergeStats::default()
            },
            error: None,
        }
    }

    /// A merge that could not be attempted at all.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            merged: None,
            has_conflicts: false,
            conflicts: Vec::new(),
            stats: MergeStats::default(),
            error: Some(error.into()),
        }
    }

    /// `true` when the caller can accept `merged` without review.
    pub fn can_auto_merge(&self) -> bool {
        self.success && !self.has_conflicts && self.merged.is_some()
    }
}

/// A contiguous change on one side: a base line range and where it ends on
/// the side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Edit {
    base_start: usize,
    base_end: usize,
    side_end: usize,
}

// ---------------------------------------------------------------------------
// Merger
// ---------------------------------------------------------------------------

/// Stateless three-way merge engine.
pub struct Merger;

impl Merger {
    /// Merge a request. Never fails: problems are reported in the result.
    pub fn merge(request: &MergeRequest) -> MergeResult {
        info!(path = %request.file_path, "performing three-way merge");
        Self::three_way_merge(&request.base, &request.ours, &request.theirs)
    }

    /// Merge `ours` and `theirs` against their common ancestor `base`.
    pub fn three_way_merge(base: &str, ours: &str, theirs: &str) -> MergeResult {
        if [base, ours, theirs].iter().any(|text| text.contains('\0')) {
            debug!("refusing to merge binary content");
            return MergeResult::failure("binary content cannot be merged line by line");
        }

        let base_lines = split_lines(base);
        let ours_lines = split_lines(ours);
        let theirs_lines = split_lines(theirs);

        // Fast paths: one side unchanged, or both made the same change.
        if ours == base {
            debug!("ours == base, theirs wins cleanly");
            return MergeResult::clean(theirs.to_string(), &base_lines, &ours_lines, &theirs_lines);
        }
        if theirs == base || ours == theirs {
            debug!("theirs == base or identical changes, ours wins cleanly");
            return MergeResult::clean(ours.to_string(), &base_lines, &ours_lines, &theirs_lines);
        }

        let ours_edits = edits(&base_lines, &ours_lines);
        let theirs_edits = edits(&base_lines, &theirs_lines);

        let mut output: Vec<&str> = Vec::new();
        let mut conflicts = Vec::new();
        let mut base_pos = 0;
        let (mut i, mut j) = (0, 0);
        let (mut ours_delta, mut theirs_delta) = (0isize, 0isize);

        while i < ours_edits.len() || j < theirs_edits.len() {
            // Seed the region with the edit that starts first.
            let take_ours = match (ours_edits.get(i), theirs_edits.get(j)) {
                (Some(o), Some(t)) => o.base_start <= t.base_start,
                (Some(_), None) => true,
                _ => false,
            };
            let seed = if take_ours { ours_edits[i] } else { theirs_edits[j] };
            let (mut lo, mut hi) = (seed.base_start, seed.base_end);
            let (first_i, first_j) = (i, j);
            if take_ours {
                i += 1;
            } else {
                j += 1;
            }

            // Absorb every edit on either side that overlaps the region.
            loop {
                let mut extended = false;
                while let Some(e) = ours_edits.get(i).filter(|e| overlaps(e, lo, hi)) {
                    lo = lo.min(e.base_start);
                    hi = hi.max(e.base_end);
                    i += 1;
                    extended = true;
                }
                while let Some(e) = theirs_edits.get(j).filter(|e| overlaps(e, lo, hi)) {
                    lo = lo.min(e.base_start);
                    hi = hi.max(e.base_end);
                    j += 1;
                    extended = true;
                }
                if !extended {
                    break;
                }
            }

            let ours_touched = i > first_i;
            let theirs_touched = j > first_j;
            let ours_lo = offset(lo, ours_delta);
            let theirs_lo = offset(lo, theirs_delta);
            if ours_touched {
                let last = ours_edits[i - 1];
                ours_delta = last.side_end as isize - last.base_end as isize;
            }
            if theirs_touched {
                let last = theirs_edits[j - 1];
                theirs_delta = last.side_end as isize - last.base_end as isize;
            }
            let chunks = (
                slice(&ours_lines, ours_lo, offset(hi, ours_delta)),
                slice(&theirs_lines, theirs_lo, offset(hi, theirs_delta)),
                base_lines.get(base_pos..lo),
            );
            let (Some(ours_chunk), Some(theirs_chunk), Some(unchanged)) = chunks else {
                warn!(start = lo + 1, end = hi, "inconsistent diff ranges");
                return MergeResult::failure("inconsistent diff ranges between the merge inputs");
            };
            output.extend_from_slice(unchanged);

            match (ours_touched, theirs_touched) {
                (true, false) => output.extend_from_slice(ours_chunk),
                (false, true) => output.extend_from_slice(theirs_chunk),
                _ if ours_chunk == theirs_chunk => output.extend_from_slice(ours_chunk),
                _ => {
                    debug!(start = lo + 1, end = hi, "overlapping change");
                    conflicts.push(MergeConflict {
                        start_line: lo + 1,
                        end_line: hi.max(lo + 1),
                        base: base_lines[lo..hi].concat(),
                        ours: ours_chunk.concat(),
                        theirs: theirs_chunk.concat(),
                    });
                }
            }

            base_pos = hi;
        }
        output.extend_from_slice(&base_lines[base_pos..]);

        let has_conflicts = !conflicts.is_empty();
        let merged = if has_conflicts {
            None
        } else {
            Some(output.concat())
        };
        let stats = MergeStats {
            base_lines: base_lines.len(),
            ours_lines: ours_lines.len(),
            theirs_lines: theirs_lines.len(),
            merged_lines: merged.as_deref().map(count_lines).unwrap_or(0),
            ours_changes: ours_edits.len(),
            theirs_changes: theirs_edits.len(),
            conflict_count: conflicts.len(),
        };

        debug!(
            conflicts = stats.conflict_count,
            ours_changes = stats.ours_changes,
            theirs_changes = stats.theirs_changes,
            "merge complete"
        );

        MergeResult {
            success: !has_conflicts,
            merged,
            has_conflicts,
            conflicts,
            stats,
            error: None,
        }
    }

    /// Quick check: can these three versions be auto-merged without conflicts?
    pub fn can_auto_merge(base: &str, ours: &str, theirs: &str) -> bool {
        Self::three_way_merge(base, ours, theirs).can_auto_merge()
    }

    /// Unified diff from `old` to `new`.
    pub fn unified_diff(old: &str, new: &str) -> String {
        diffy::create_patch(old, new).to_string()
    }
}

/// Split into lines keeping terminators, so concatenation is lossless.
fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

fn count_lines(text: &str) -> usize {
    text.split_inclusive('\n').count()
}

fn offset(index: usize, delta: isize) -> Option<usize> {
    usize::try_from(index as isize + delta).ok()
}

fn slice<'a, 'b>(
    lines: &'b [&'a str],
    lo: Option<usize>,
    hi: Option<usize>,
) -> Option<&'b [&'a str]> {
    lines.get(lo?..hi?)
}

/// Does `edit` overlap the base region `[lo, hi)`? Ranges that intersect
/// overlap, and so do edits starting at the region start (two insertions at
/// the same point have no natural order).
fn overlaps(edit: &Edit, lo: usize, hi: usize) -> bool {
    (edit.base_start < hi && lo < edit.base_end) || edit.base_start == lo
}

/// Changed regions from `base` to `side`: the gaps between consecutive
/// equal runs of the diff, plus the tail after the last one. Equal runs are
/// the only ops whose base and side ranges are both authoritative.
fn edits(base: &[&str], side: &[&str]) -> Vec<Edit> {
    let ops = similar::capture_diff_slices(Algorithm::Myers, base, side);
    let mut edits = Vec::new();
    let (mut base_pos, mut side_pos) = (0, 0);
    for op in ops {
        let (tag, old, new) = op.as_tag_tuple();
        if tag != DiffTag::Equal {
            continue;
        }
        if old.start > base_pos || new.start > side_pos {
            edits.push(Edit {
                base_start: base_pos,
                base_end: old.start,
                side_end: new.start,
            });
        }
        base_pos = old.end;
        side_pos = new.end;
    }
    if base_pos < base.len() || side_pos < side.len() {
        edits.push(Edit {
            base_start: base_pos,
            base_end: base.len(),
            side_end: side.len(),
        });
    }
    edits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_files() {
        let base = "line1\nline2\nline3\n";
        let result = Merger::three_way_merge(base, base, base);
        assert!(result.success);
        assert!(!result.has_conflicts);
        assert_eq!(result.merged.as_deref(), Some(base));
    }

    #[test]
    fn test_only_ours_changed() {
        let base = "line1\nline2\nline3\n";
        let ours = "line1\nmodified\nline3\n";
        let result = Merger::three_way_merge(base, ours, base);
        assert_eq!(result.merged.as_deref(), Some(ours));
    }

    #[test]
    fn test_only_theirs_changed() {
        let base = "line1\nline2\nline3\n";
        let theirs = "line1\nline2\nmodified\n";
        let result = Merger::three_way_merge(base, base, theirs);
        assert_eq!(result.merged.as_deref(), Some(theirs));
    }

    #[test]
    fn test_same_change_both_sides_regardless_of_base() {
        let result = Merger::three_way_merge("anything\nelse\n", "new\n", "new\n");
        assert!(result.success);
        assert_eq!(result.merged.as_deref(), Some("new\n"));
    }

    #[test]
    fn test_non_overlapping_changes() {
        let base = "aaa\nbbb\nccc\nddd\neee\n";
        let ours = "AAA\nbbb\nccc\nddd\neee\n";
        let theirs = "aaa\nbbb\nccc\nddd\nEEE\n";
        let result = Merger::three_way_merge(base, ours, theirs);
        assert!(result.success);
        assert_eq!(result.merged.as_deref(), Some("AAA\nbbb\nccc\nddd\nEEE\n"));
        assert_eq!(result.stats.ours_changes, 1);
        assert_eq!(result.stats.theirs_changes, 1);
        assert_eq!(result.stats.merged_lines, 5);
    }

    #[test]
    fn test_adjacent_line_changes_merge() {
        let base = "a\nb\nc\nd\n";
        let ours = "a\nB\nc\nd\n";
        let theirs = "a\nb\nC\nd\n";
        let result = Merger::three_way_merge(base, ours, theirs);
        assert_eq!(result.merged.as_deref(), Some("a\nB\nC\nd\n"));
    }

    #[test]
    fn test_insertions_and_deletions_merge() {
        let base = "one\ntwo\nthree\nfour\n";
        let ours = "zero\none\ntwo\nthree\nfour\n";
        let theirs = "one\ntwo\nfour\nfive\n";
        let result = Merger::three_way_merge(base, ours, theirs);
        assert_eq!(
            result.merged.as_deref(),
            Some("zero\none\ntwo\nfour\nfive\n")
        );
    }

    #[test]
    fn test_conflicting_changes_report_verbatim_hunk() {
        let base = "line1\noriginal\nline3\n";
        let ours = "line1\nours_version\nline3\n";
        let theirs = "line1\ntheirs_version\nline3\n";
        let result = Merger::three_way_merge(base, ours, theirs);

        assert!(!result.success);
        assert!(result.has_conflicts);
        assert!(result.merged.is_none());
        assert_eq!(
            result.conflicts,
            vec![MergeConflict {
                start_line: 2,
                end_line: 2,
                base: "original\n".into(),
                ours: "ours_version\n".into(),
                theirs: "theirs_version\n".into(),
            }]
        );
        assert_eq!(result.stats.conflict_count, 1);
        assert_eq!(result.stats.merged_lines, 0);
    }

    #[test]
    fn test_competing_insertions_conflict() {
        let base = "a\nb\n";
        let ours = "a\nx\nb\n";
        let theirs = "a\ny\nb\n";
        let result = Merger::three_way_merge(base, ours, theirs);
        assert_eq!(result.conflicts.len(), 1);
        let hunk = &result.conflicts[0];
        assert_eq!((hunk.start_line, hunk.end_line), (2, 2));
        assert_eq!(hunk.base, "");
        assert_eq!(hunk.ours, "x\n");
        assert_eq!(hunk.theirs, "y\n");
    }

    #[test]
    fn test_identical_deletion_both_sides() {
        let base = "a\nb\nc\nd\n";
        let ours = "a\nc\nd\nOURS\n";
        let theirs = "THEIRS\na\nc\nd\n";
        let result = Merger::three_way_merge(base, ours, theirs);
        assert_eq!(result.merged.as_deref(), Some("THEIRS\na\nc\nd\nOURS\n"));
    }

    #[test]
    fn test_conflict_keeps_clean_regions_out_of_hunks() {
        let base = "h\n1\n2\n3\n4\n5\nt\n";
        let ours = "H\n1\n2\nX\n4\n5\nt\n";
        let theirs = "h\n1\n2\nY\n4\n5\nT\n";
        let result = Merger::three_way_merge(base, ours, theirs);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].start_line, 4);
        assert_eq!(result.conflicts[0].base, "3\n");
    }

    #[test]
    fn test_binary_input_fails_without_panicking() {
        let result = Merger::three_way_merge("a\0b", "a\0c", "a\0d");
        assert!(!result.success);
        assert!(result.error.is_some());
        assert!(!Merger::can_auto_merge("a\0b", "a\0c", "a\0d"));
    }

    #[test]
    fn test_merge_request() {
        let request = MergeRequest {
            file_path: "src/lib.rs".into(),
            base: "a\n".into(),
            ours: "a\n".into(),
            theirs: "b\n".into(),
        };
        assert_eq!(Merger::merge(&request).merged.as_deref(), Some("b\n"));
    }

    #[test]
    fn test_unified_diff() {
        let diff = Merger::unified_diff("a\nb\n", "a\nc\n");
        assert!(diff.contains("-b"));
        assert!(diff.contains("+c"));
    }

    /// Small deterministic generator for merge inputs.
    struct Lines(u64);

    impl Lines {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn text(&mut self) -> String {
            const ALPHABET: [&str; 6] = ["a\n", "b\n", "c\n", "d\n", "z\n", "\n"];
            let len = (self.next() % 6) as usize;
            let mut text: String = (0..len)
                .map(|_| ALPHABET[(self.next() % ALPHABET.len() as u64) as usize])
                .collect();
            if self.next() % 8 == 0 {
                text.push('q');
            }
            text
        }
    }

    fn assert_merge_invariants(base: &str, ours: &str, theirs: &str) {
        let forward = Merger::three_way_merge(base, ours, theirs);
        let backward = Merger::three_way_merge(base, theirs, ours);
        let case = format!("base={:?} ours={:?} theirs={:?}", base, ours, theirs);

        assert!(forward.error.is_none(), "{}", case);
        assert_eq!(forward.success, !forward.has_conflicts, "{}", case);
        assert_eq!(forward.success, forward.merged.is_some(), "{}", case);
        assert_eq!(forward.has_conflicts, backward.has_conflicts, "{}", case);
        assert_eq!(forward.merged, backward.merged, "{}", case);

        assert_eq!(Merger::three_way_merge(base, ours, ours).merged.as_deref(), Some(ours));
        assert_eq!(Merger::three_way_merge(base, base, theirs).merged.as_deref(), Some(theirs));
        assert_eq!(Merger::three_way_merge(base, ours, base).merged.as_deref(), Some(ours));
    }

    #[test]
    fn test_mismatched_delete_insert_ranges() {
        let cases = [
            ("d\nb\n", "d\na\n", "b\nz\nb\n"),
            ("a\nb\n", "a\nb\n\n", "b\nx\nb\n"),
            ("a\nb\nc\n", "b\nc\na\n", "c\na\nb\n"),
            ("", "a\n", "b\n"),
            ("a\n", "", "a\nb\n"),
        ];
        for (base, ours, theirs) in cases {
            assert_merge_invariants(base, ours, theirs);
        }
    }

    #[test]
    fn test_random_small_merges() {
        let mut lines = Lines(0x9E37_79B9_7F4A_7C15);
        for _ in 0..5000 {
            let base = lines.text();
            let ours = lines.text();
            let theirs = lines.text();
            assert_merge_invariants(&base, &ours, &theirs);
        }
    }

    #[test]
    fn test_clean_merge_keeps_both_edits() {
        let base = "one\ntwo\nthree\nfour\nfive\n";
        let ours = "ONE\ntwo\nthree\nfour\nfive\n";
        let theirs = "one\ntwo\nthree\nfour\nFIVE\nsix\n";
        let result = Merger::three_way_merge(base, ours, theirs);
        assert_eq!(
            result.merged.as_deref(),
            Some("ONE\ntwo\nthree\nfour\nFIVE\nsix\n")
        );
    }
}
