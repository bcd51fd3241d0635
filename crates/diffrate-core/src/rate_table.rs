//! The persisted compression rate table (`compression_rate.json`).
//!
//! ```text
//! {
//!   "ViT-B-DeiT": {
//!     "3.0": {
//!       "prune_kept_num": "[197, 197, 196, ...]",
//!       "merge_kept_num": "[197]*2 + [180, ...]"
//!     }
//!   }
//! }
//! ```
//!
//! Kept-count fields are list expressions: integer list literals, `+`
//! concatenation, `*` repetition by an integer and parentheses. Written
//! entries always use the canonical `"[a, b, c]"` form and the file is
//! serialized with sorted keys, so re-writing unchanged data is byte-stable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::budget::Schedule;
use crate::error::RateTableError;

// ---------------------------------------------------------------------------
// Table types
// ---------------------------------------------------------------------------

/// One `(model, target_flops)` entry as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateEntry {
    /// Expression for the per-block pruning counts.
    pub prune_kept_num: String,
    /// Expression for the per-block merging counts.
    pub merge_kept_num: String,
}

impl RateEntry {
    /// Canonical entry for `schedule`.
    pub fn from_schedule(schedule: &Schedule) -> Self {
        RateEntry {
            prune_kept_num: format_kept_list(&schedule.prune_kept_num),
            merge_kept_num: format_kept_list(&schedule.merge_kept_num),
        }
    }

    /// Evaluate both expressions.
    pub fn schedule(&self) -> Result<Schedule, RateTableError> {
        Ok(Schedule {
            prune_kept_num: eval_kept_expr("prune_kept_num", &self.prune_kept_num)?,
            merge_kept_num: eval_kept_expr("merge_kept_num", &self.merge_kept_num)?,
        })
    }
}

/// Mapping `display name -> target flops key -> entry`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompressionRateTable {
    models: BTreeMap<String, BTreeMap<String, RateEntry>>,
}

/// Table key for a FLOPs target, formatted like a Python float (`3.0`, `2.9`).
pub fn flops_key(target_flops: f64) -> String {
    if target_flops.fract() == 0.0 && target_flops.abs() < 1e16 {
        format!("{target_flops:.1}")
    } else {
        format!("{target_flops}")
    }
}

impl CompressionRateTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a table from `path`.
    pub fn load(path: &Path) -> Result<Self, RateTableError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| RateTableError::Io { path: path.to_path_buf(), source })?;
        let table: CompressionRateTable = serde_json::from_str(&text)
            .map_err(|source| RateTableError::Json { path: path.to_path_buf(), source })?;
        debug!("loaded compression rate table with {} models from {}", table.models.len(), path.display());
        Ok(table)
    }

    /// Read `path` if it exists, otherwise start from an empty table.
    pub fn load_or_default(path: &Path) -> Result<Self, RateTableError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::new())
        }
    }

    /// Write the table as pretty JSON. The file is replaced atomically.
    pub fn save(&self, path: &Path) -> Result<(), RateTableError> {
        let io_err = |source| RateTableError::Io { path: path.to_path_buf(), source };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut json = serde_json::to_string_pretty(self)
            .map_err(|source| RateTableError::Json { path: path.to_path_buf(), source })?;
        json.push('\n');
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    /// Raw entry for `(model, target_flops)`.
    pub fn entry(&self, model: &str, target_flops: f64) -> Option<&RateEntry> {
        self.models.get(model)?.get(&flops_key(target_flops))
    }

    /// Evaluated schedule for `(model, target_flops)`.
    ///
    /// # Errors
    ///
    /// [`RateTableError::EntryNotFound`] when the pair is absent; the caller
    /// must abort rather than substitute a default schedule.
    pub fn lookup(&self, model: &str, target_flops: f64) -> Result<Schedule, RateTableError> {
        let key = flops_key(target_flops);
        let entry = self
            .models
            .get(model)
            .and_then(|targets| targets.get(&key))
            .ok_or_else(|| RateTableError::EntryNotFound {
                model: model.to_string(),
                target_flops: key.clone(),
            })?;
        let schedule = entry.schedule()?;
        if schedule.prune_kept_num.len() != schedule.merge_kept_num.len() {
            return Err(RateTableError::InvalidSchedule {
                model: model.to_string(),
                target_flops: key,
                source: crate::error::BudgetError::LengthMismatch {
                    prune: schedule.prune_kept_num.len(),
                    merge: schedule.merge_kept_num.len(),
                },
            });
        }
        Ok(schedule)
    }

    /// Insert or replace the entry for `(model, target_flops)`.
    ///
    /// Returns `true` when the stored entry changed.
    pub fn upsert(&mut self, model: &str, target_flops: f64, schedule: &Schedule) -> bool {
        let entry = RateEntry::from_schedule(schedule);
        let slot = self.models.entry(model.to_string()).or_default();
        let key = flops_key(target_flops);
        let changed = slot.get(&key) != Some(&entry);
        if changed {
            info!("recording schedule for {model} @ {key}G");
        }
        slot.insert(key, entry);
        changed
    }

    /// Model display names present in the table.
    pub fn models(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// FLOPs keys recorded for `model`.
    pub fn targets(&self, model: &str) -> Vec<&str> {
        self.models
            .get(model)
            .map(|t| t.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Expression formatting / evaluation
// ---------------------------------------------------------------------------

/// Canonical list literal, e.g. `[197, 150, 120]`.
pub fn format_kept_list(values: &[usize]) -> String {
    let items: Vec<String> = values.iter().map(usize::to_string).collect();
    format!("[{}]", items.join(", "))
}

/// Evaluate a kept-count expression such as `"[197]*3 + [150, 120]"`.
pub fn eval_kept_expr(field: &'static str, expr: &str) -> Result<Vec<usize>, RateTableError> {
    let mut parser = ExprParser { src: expr.as_bytes(), pos: 0 };
    let result = parser.expr().and_then(|v| {
        parser.skip_ws();
        if parser.pos == parser.src.len() {
            Ok(v)
        } else {
            Err(format!("unexpected `{}` at offset {}", parser.peek_char(), parser.pos))
        }
    });
    result.map_err(|reason| RateTableError::Expression { field, expr: expr.to_string(), reason })
}

/// Recursive-descent evaluator.
///
/// ```text
/// expr   := term ('+' term)*
/// term   := factor ('*' INT)* | INT '*' factor
/// factor := '[' (INT (',' INT)* ','?)? ']' | '(' expr ')'
/// ```
struct ExprParser<'a> {
    src: &'a [u8],
    pos: usize,
}

impl ExprParser<'_> {
    fn skip_ws(&mut self) {
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.src.get(self.pos).copied()
    }

    fn peek_char(&self) -> char {
        self.src.get(self.pos).map(|&b| b as char).unwrap_or('?')
    }

    fn eat(&mut self, byte: u8) -> bool {
        if self.peek() == Some(byte) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), String> {
        if self.eat(byte) {
            Ok(())
        } else {
            Err(format!("expected `{}` at offset {}", byte as char, self.pos))
        }
    }

    fn int(&mut self) -> Result<usize, String> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.src.len() && self.src[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(format!("expected integer at offset {start}"));
        }
        std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|e| e.to_string())?
            .parse::<usize>()
            .map_err(|e| e.to_string())
    }

    fn expr(&mut self) -> Result<Vec<usize>, String> {
        let mut out = self.term()?;
        while self.eat(b'+') {
            out.extend(self.term()?);
            if out.len() > MAX_EXPR_LEN {
                return Err(format!("list longer than {MAX_EXPR_LEN} entries"));
            }
        }
        Ok(out)
    }

    fn term(&mut self) -> Result<Vec<usize>, String> {
        if matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            let times = self.int()?;
            self.expect(b'*')?;
            let list = self.factor()?;
            return repeat(&list, times);
        }
        let mut list = self.factor()?;
        while self.eat(b'*') {
            let times = self.int()?;
            list = repeat(&list, times)?;
        }
        Ok(list)
    }

    fn factor(&mut self) -> Result<Vec<usize>, String> {
        if self.eat(b'(') {
            let inner = self.expr()?;
            self.expect(b')')?;
            return Ok(inner);
        }
        self.expect(b'[')?;
        let mut items = Vec::new();
        if self.eat(b']') {
            return Ok(items);
        }
        loop {
            items.push(self.int()?);
            if self.eat(b',') {
                if self.eat(b']') {
                    break;
                }
                continue;
            }
            self.expect(b']')?;
            break;
        }
        Ok(items)
    }
}

/// Longest list an expression may produce.
const MAX_EXPR_LEN: usize = 4096;

fn repeat(list: &[usize], times: usize) -> Result<Vec<usize>, String> {
    let len = list
        .len()
        .checked_mul(times)
        .filter(|&n| n <= MAX_EXPR_LEN)
        .ok_or_else(|| format!("repeating {} entries {times} times exceeds {MAX_EXPR_LEN} entries", list.len()))?;
    if list.is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Vec::with_capacity(len);
    for _ in 0..times {
        out.extend_from_slice(list);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flops_keys_follow_python_float_repr() {
        assert_eq!(flops_key(3.0), "3.0");
        assert_eq!(flops_key(2.9), "2.9");
        assert_eq!(flops_key(11.5), "11.5");
        assert_eq!(flops_key(10.0), "10.0");
    }

    #[test]
    fn plain_list_evaluates() {
        assert_eq!(eval_kept_expr("prune_kept_num", "[197, 150, 120]").unwrap(), vec![197, 150, 120]);
        assert_eq!(eval_kept_expr("prune_kept_num", " [ 4 , 3, ] ").unwrap(), vec![4, 3]);
        assert!(eval_kept_expr("prune_kept_num", "[]").unwrap().is_empty());
    }

    #[test]
    fn repetition_and_concatenation() {
        let v = eval_kept_expr("merge_kept_num", "[197]*2 + [150, 120] + 2*[8]").unwrap();
        assert_eq!(v, vec![197, 197, 150, 120, 8, 8]);
        let v = eval_kept_expr("merge_kept_num", "([1, 2] + [3])*2").unwrap();
        assert_eq!(v, vec![1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn garbage_is_rejected_with_field_name() {
        let err = eval_kept_expr("prune_kept_num", "[197, x]").unwrap_err();
        assert!(err.to_string().contains("prune_kept_num"));
        assert!(eval_kept_expr("prune_kept_num", "[1] [2]").is_err());
        assert!(eval_kept_expr("prune_kept_num", "__import__('os')").is_err());
    }

    #[test]
    fn oversized_repetition_is_an_expression_error() {
        for expr in ["[1, 2]*9223372036854775807", "18446744073709551615*[7]", "([8]*4000)*4000"] {
            let err = eval_kept_expr("prune_kept_num", expr).unwrap_err();
            assert!(matches!(err, RateTableError::Expression { field: "prune_kept_num", .. }), "{expr}: {err}");
        }
        assert_eq!(eval_kept_expr("merge_kept_num", "[]*9223372036854775807 + [4]").unwrap(), vec![4]);
    }

    #[test]
    fn canonical_format_round_trips() {
        let values = vec![197, 196, 64, 8];
        let text = format_kept_list(&values);
        assert_eq!(text, "[197, 196, 64, 8]");
        assert_eq!(eval_kept_expr("prune_kept_num", &text).unwrap(), values);
    }

    #[test]
    fn missing_entry_is_not_found() {
        let mut table = CompressionRateTable::new();
        table.upsert("ViT-S-DeiT", 2.9, &Schedule::full(12, 197));
        let err = table.lookup("ViT-B-DeiT", 3.0).unwrap_err();
        assert!(matches!(err, RateTableError::EntryNotFound { .. }));
        assert!(err.to_string().contains("not found"));
        assert!(matches!(table.lookup("ViT-S-DeiT", 3.0), Err(RateTableError::EntryNotFound { .. })));
    }

    #[test]
    fn upsert_reports_changes() {
        let mut table = CompressionRateTable::new();
        let s = Schedule::full(2, 17);
        assert!(table.upsert("m", 1.0, &s));
        assert!(!table.upsert("m", 1.0, &s));
        assert_eq!(table.targets("m"), vec!["1.0"]);
    }
}
