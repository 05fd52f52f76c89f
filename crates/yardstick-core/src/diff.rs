//! Line-level diffing and edit-distance similarity.
//!
//! Line diffs use Myers' O(ND) algorithm after stripping the common prefix
//! and suffix. Similarity is `1 - levenshtein(a, b) / max(len(a), len(b))`
//! over Unicode scalar values, always in `[0.0, 1.0]`.

/// Bytes inspected when sniffing for binary content (same window as git).
const BINARY_SNIFF_LEN: usize = 8000;

/// Upper bound on DP cells for character-level edit distance. Larger
/// inputs fall back to a line-level estimate.
const MAX_EDIT_CELLS: usize = 16_000_000;

/// One step of a line edit script. Indices are 0-based line numbers in
/// the old and new text respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffOp {
    Equal { old: usize, new: usize },
    Delete { old: usize },
    Insert { new: usize },
}

/// Result of diffing two texts line by line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineDiff<'a> {
    pub old_lines: Vec<&'a str>,
    pub new_lines: Vec<&'a str>,
    pub ops: Vec<DiffOp>,
}

impl LineDiff<'_> {
    /// Number of inserted lines.
    pub fn added(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, DiffOp::Insert { .. }))
            .count()
    }

    /// Number of deleted lines.
    pub fn removed(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, DiffOp::Delete { .. }))
            .count()
    }

    /// Whether the texts have identical lines.
    pub fn is_unchanged(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, DiffOp::Equal { .. }))
    }

    /// Render the diff in unified format with `context` lines around each
    /// change. Returns an empty string when nothing changed.
    pub fn unified(&self, old_name: &str, new_name: &str, context: usize) -> String {
        if self.is_unchanged() {
            return String::new();
        }

        // Line positions before each op.
        let mut positions = Vec::with_capacity(self.ops.len());
        let (mut old_pos, mut new_pos) = (0usize, 0usize);
        for op in &self.ops {
            positions.push((old_pos, new_pos));
            match op {
                DiffOp::Equal { .. } => {
                    old_pos += 1;
                    new_pos += 1;
                }
                DiffOp::Delete { .. } => old_pos += 1,
                DiffOp::Insert { .. } => new_pos += 1,
            }
        }

        let changes: Vec<usize> = self
            .ops
            .iter()
            .enumerate()
            .filter(|(_, op)| !matches!(op, DiffOp::Equal { .. }))
            .map(|(i, _)| i)
            .collect();

        // Group change indices into hunk ranges [start, end).
        let mut hunks: Vec<(usize, usize)> = Vec::new();
        for &i in &changes {
            let start = i.saturating_sub(context);
            let end = (i + context + 1).min(self.ops.len());
            match hunks.last_mut() {
                Some(last) if start <= last.1 => last.1 = end,
                _ => hunks.push((start, end)),
            }
        }

        let mut out = format!("--- {old_name}\n+++ {new_name}\n");
        for (start, end) in hunks {
            let slice = &self.ops[start..end];
            let old_count = slice
                .iter()
                .filter(|op| !matches!(op, DiffOp::Insert { .. }))
                .count();
            let new_count = slice
                .iter()
                .filter(|op| !matches!(op, DiffOp::Delete { .. }))
                .count();
            let (old_start, new_start) = positions[start];
            let old_start = if old_count == 0 { old_start } else { old_start + 1 };
            let new_start = if new_count == 0 { new_start } else { new_start + 1 };
            out.push_str(&format!(
                "@@ -{old_start},{old_count} +{new_start},{new_count} @@\n"
            ));
            for op in slice {
                match *op {
                    DiffOp::Equal { old, .. } => {
                        out.push(' ');
                        out.push_str(self.old_lines[old]);
                    }
                    DiffOp::Delete { old } => {
                        out.push('-');
                        out.push_str(self.old_lines[old]);
                    }
                    DiffOp::Insert { new } => {
                        out.push('+');
                        out.push_str(self.new_lines[new]);
                    }
                }
                out.push('\n');
            }
        }
        out
    }
}

/// Diff two texts line by line.
pub fn diff_lines<'a>(old: &'a str, new: &'a str) -> LineDiff<'a> {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let prefix = old_lines
        .iter()
        .zip(&new_lines)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old_lines[prefix..]
        .iter()
        .rev()
        .zip(new_lines[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let old_mid = &old_lines[prefix..old_lines.len() - suffix];
    let new_mid = &new_lines[prefix..new_lines.len() - suffix];

    let mut ops: Vec<DiffOp> = (0..prefix).map(|i| DiffOp::Equal { old: i, new: i }).collect();
    ops.extend(myers(old_mid, new_mid).into_iter().map(|op| match op {
        DiffOp::Equal { old, new } => DiffOp::Equal {
            old: old + prefix,
            new: new + prefix,
        },
        DiffOp::Delete { old } => DiffOp::Delete { old: old + prefix },
        DiffOp::Insert { new } => DiffOp::Insert { new: new + prefix },
    }));
    let old_tail = old_lines.len() - suffix;
    let new_tail = new_lines.len() - suffix;
    ops.extend((0..suffix).map(|i| DiffOp::Equal {
        old: old_tail + i,
        new: new_tail + i,
    }));

    LineDiff {
        old_lines,
        new_lines,
        ops,
    }
}

/// Myers shortest edit script between two line slices.
fn myers(a: &[&str], b: &[&str]) -> Vec<DiffOp> {
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max = (n + m) as usize;
    if max == 0 {
        return Vec::new();
    }

    let offset = max as isize;
    let idx = |k: isize| (k + offset) as usize;
    let mut v = vec![0isize; 2 * max + 2];
    let mut trace: Vec<Vec<isize>> = Vec::new();
    let mut final_d = 0isize;

    'search: for d in 0..=max as isize {
        trace.push(v.clone());
        let mut k = -d;
        while k <= d {
            let mut x = if k == -d || (k != d && v[idx(k - 1)] < v[idx(k + 1)]) {
                v[idx(k + 1)]
            } else {
                v[idx(k - 1)] + 1
            };
            let mut y = x - k;
            while x < n && y < m && a[x as usize] == b[y as usize] {
                x += 1;
                y += 1;
            }
            v[idx(k)] = x;
            if x >= n && y >= m {
                final_d = d;
                break 'search;
            }
            k += 2;
        }
    }

    let mut ops = Vec::new();
    let (mut x, mut y) = (n, m);
    for d in (0..=final_d).rev() {
        let v = &trace[d as usize];
        let k = x - y;
        let prev_k = if k == -d || (k != d && v[idx(k - 1)] < v[idx(k + 1)]) {
            k + 1
        } else {
            k - 1
        };
        let prev_x = v[idx(prev_k)];
        let prev_y = prev_x - prev_k;

        while x > prev_x && y > prev_y {
            ops.push(DiffOp::Equal {
                old: (x - 1) as usize,
                new: (y - 1) as usize,
            });
            x -= 1;
            y -= 1;
        }
        if d > 0 {
            if x == prev_x {
                ops.push(DiffOp::Insert {
                    new: (y - 1) as usize,
                });
            } else {
                ops.push(DiffOp::Delete {
                    old: (x - 1) as usize,
                });
            }
        }
        x = prev_x;
        y = prev_y;
    }

    ops.reverse();
    ops
}

/// Character-level Levenshtein distance.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    levenshtein_chars(&a, &b)
}

fn levenshtein_chars(a: &[char], b: &[char]) -> usize {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let (a, b) = (&a[prefix..], &b[prefix..]);
    let suffix = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let (a, b) = (&a[..a.len() - suffix], &b[..b.len() - suffix]);

    // Keep the shorter string in the inner loop.
    let (long, short) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    if short.is_empty() {
        return long.len();
    }

    let mut prev: Vec<usize> = (0..=short.len()).collect();
    let mut curr = vec![0usize; short.len() + 1];
    for (i, lc) in long.iter().enumerate() {
        curr[0] = i + 1;
        for (j, sc) in short.iter().enumerate() {
            let cost = usize::from(lc != sc);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[short.len()]
}

/// Similarity of two texts in `[0.0, 1.0]`; identical texts score `1.0`.
///
/// Inputs whose edit-distance table would exceed an internal size bound are
/// scored from the line diff instead:
/// `1 - (added + removed) / (old_lines + new_lines)`.
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let a_chars: Vec<char> = a.chars().collect();
    let b_chars: Vec<char> = b.chars().collect();
    let longest = a_chars.len().max(b_chars.len());
    if longest == 0 {
        return 1.0;
    }

    if a_chars.len().saturating_mul(b_chars.len()) > MAX_EDIT_CELLS {
        let diff = diff_lines(a, b);
        let lines = diff.old_lines.len() + diff.new_lines.len();
        if lines == 0 {
            return 1.0;
        }
        let changed = diff.added() + diff.removed();
        return (1.0 - changed as f64 / lines as f64).clamp(0.0, 1.0);
    }

    let distance = levenshtein_chars(&a_chars, &b_chars);
    (1.0 - distance as f64 / longest as f64).clamp(0.0, 1.0)
}

/// Heuristic binary detection: a NUL byte in the first 8000 bytes, or
/// content that is not valid UTF-8.
pub fn is_binary(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(BINARY_SNIFF_LEN)];
    window.contains(&0) || std::str::from_utf8(bytes).is_err()
}
