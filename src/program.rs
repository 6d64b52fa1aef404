//! Program and block text model
//!
//! A [`Program`] is an ordered tree of lexical scopes rendered into bpftrace
//! source: include lines first, then struct definitions, then probe and
//! interval blocks. Blocks live in an arena addressed by [`BlockId`] so the
//! builder can keep handles into the tree while it grows. Every block tracks
//! the set of objects already materialized on its path to the program root;
//! that context is the basis for cast deduplication.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use indexmap::{IndexMap, IndexSet};

use crate::probes::Probe;
use crate::tracer::CommonOptions;

pub(crate) const PROGRAM_INDENT: &str = "    ";

/// Interval of the periodic cleanup block for timing maps.
pub(crate) const AGGR_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

/// Aggregation functions supported by bpftrace maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggrFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Hist,
}

impl AggrFunc {
    pub const ALL: [AggrFunc; 6] = [
        AggrFunc::Count,
        AggrFunc::Sum,
        AggrFunc::Avg,
        AggrFunc::Min,
        AggrFunc::Max,
        AggrFunc::Hist,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AggrFunc::Count => "count",
            AggrFunc::Sum => "sum",
            AggrFunc::Avg => "avg",
            AggrFunc::Min => "min",
            AggrFunc::Max => "max",
            AggrFunc::Hist => "hist",
        }
    }
}

impl fmt::Display for AggrFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AggrFunc {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|af| af.as_str() == s)
            .ok_or_else(|| anyhow!("invalid aggregate function '{s}'"))
    }
}

/// A bpftrace expression fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Expression(String);

impl Expression {
    pub fn new(e: impl Into<String>) -> Self {
        Self(e.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Expression {
    fn from(e: &str) -> Self {
        Self(e.to_string())
    }
}

impl From<String> for Expression {
    fn from(e: String) -> Self {
        Self(e)
    }
}

/// Formats an expression accessing `field` of object variable `obj`.
/// Either part may be empty: raw arguments and globals have no object.
pub fn expr_field(obj: &str, field: &str) -> Expression {
    if obj.is_empty() {
        Expression::new(field)
    } else if field.is_empty() {
        Expression::new(obj)
    } else {
        Expression::new(format!("{obj}->{field}"))
    }
}

/// Joins expressions as a comma separated list.
pub fn expr_join(exprs: &[Expression]) -> Expression {
    join_with(exprs, ", ")
}

/// Joins expressions with a binary operator, e.g. `a && b`.
pub fn expr_join_op(exprs: &[Expression], op: &str) -> Expression {
    join_with(exprs, &format!(" {op} "))
}

fn join_with(exprs: &[Expression], sep: &str) -> Expression {
    let mut out = String::new();
    for (i, expr) in exprs.iter().enumerate() {
        if i > 0 {
            out.push_str(sep);
        }
        out.push_str(expr.as_str());
    }
    Expression(out)
}

/// A single entry of a block: literal text terminated by `;` on render,
/// or a nested child block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Text(String),
    Block(BlockId),
}

impl Statement {
    pub fn text(s: impl Into<String>) -> Self {
        Statement::Text(s.into())
    }
}

/// Custom structure definition embedded into the generated script. Useful
/// when a header is not shipped with linux-headers, or when bpftrace cannot
/// handle an aspect of the real type such as arrays or bit fields.
///
/// The registered text must be the anonymous body: it is wrapped into an
/// outer `struct <name> { ... }` because the bpftrace parser does not accept
/// GCC attributes at top level.
#[derive(Debug, Clone)]
pub struct StructDef {
    type_name: String,
    lines: Vec<String>,
    raw: String,
}

impl StructDef {
    pub(crate) fn new(type_name: impl Into<String>, raw_text: &str) -> Self {
        Self {
            type_name: type_name.into(),
            lines: raw_text.lines().map(str::to_string).collect(),
            raw: raw_text.to_string(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub(crate) fn raw_text(&self) -> &str {
        &self.raw
    }
}

/// Handle of a block within its [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(usize);

#[derive(Debug, Clone)]
struct BlockNode {
    preamble: String,
    statements: Vec<Statement>,
    probe: Option<Probe>,
    context: HashSet<String>,
}

/// An ordered tree of blocks plus the includes and struct definitions they
/// require. Rendering is stable: identical programs render byte-identical.
#[derive(Debug, Clone, Default)]
pub struct Program {
    header_files: IndexSet<String>,
    struct_defs: IndexMap<String, StructDef>,
    roots: Vec<BlockId>,
    nodes: Vec<BlockNode>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_node(&mut self, node: BlockNode) -> BlockId {
        let id = BlockId(self.nodes.len());
        self.nodes.push(node);
        id
    }

    /// Adds a top-level block with the given preamble (probe definition).
    pub fn add_probe_block(&mut self, preamble: impl Into<String>, probe: Option<&Probe>) -> BlockId {
        let id = self.push_node(BlockNode {
            preamble: preamble.into(),
            statements: Vec::new(),
            probe: probe.cloned(),
            context: HashSet::new(),
        });
        self.roots.push(id);
        id
    }

    /// Adds a top-level `interval` block firing with the given period.
    pub fn add_interval_block(&mut self, interval: Duration) -> BlockId {
        let preamble = if interval.as_secs() > 0 {
            format!("interval:s:{}", interval.as_secs())
        } else {
            format!("interval:ms:{}", interval.as_millis())
        };
        self.add_probe_block(preamble, None)
    }

    /// Interval block that additionally fires on tracer exit.
    pub fn add_interval_or_end_block(&mut self, interval: Duration) -> BlockId {
        let block = self.add_interval_block(interval);
        let node = &mut self.nodes[block.0];
        node.preamble = format!("{}, END", node.preamble);
        block
    }

    /// Self-contained timeout: halts the tracer after the configured time.
    pub(crate) fn add_common_block(&mut self, opt: &CommonOptions) {
        let timeout_block = self.add_interval_block(opt.timeout);
        self.add_stmt(timeout_block, "exit()");
    }

    /// Periodic dump of the unnamed aggregation map.
    pub(crate) fn add_aggr_dump_block(&mut self, interval: Duration) {
        let block = self.add_interval_block(interval);
        self.add(block, Statement::text("time()"));
        self.add(block, Statement::text("print(@)"));
        self.add(block, Statement::text("clear(@)"));
    }

    /// Cleanup of timing maps so they do not leak between dumps.
    pub(crate) fn add_aggr_cleanup_block(&mut self, aggrs: &[&str]) {
        let block = self.add_interval_or_end_block(AGGR_CLEANUP_INTERVAL);
        for aggr in aggrs {
            self.add_stmt(block, format!("clear({aggr})"));
        }
    }

    /// Appends a statement to a block.
    pub fn add(&mut self, block: BlockId, stmt: Statement) {
        self.nodes[block.0].statements.push(stmt);
    }

    /// Appends a literal text statement to a block.
    pub fn add_stmt(&mut self, block: BlockId, text: impl Into<String>) {
        self.add(block, Statement::Text(text.into()));
    }

    /// Adds a nested child block. The child inherits the parent's probe and
    /// a copy of its context.
    pub fn add_block(&mut self, parent: BlockId, preamble: impl Into<String>) -> BlockId {
        let node = BlockNode {
            preamble: preamble.into(),
            statements: Vec::new(),
            probe: self.nodes[parent.0].probe.clone(),
            context: self.nodes[parent.0].context.clone(),
        };
        let child = self.push_node(node);
        self.nodes[parent.0].statements.push(Statement::Block(child));
        child
    }

    /// Adds a nested `if` block with AND-joined conditions.
    pub fn add_if_block(&mut self, parent: BlockId, conds: &[Expression]) -> BlockId {
        self.add_block(parent, format!("if ({})", expr_join_op(conds, "&&")))
    }

    pub fn probe(&self, block: BlockId) -> Option<&Probe> {
        self.nodes[block.0].probe.as_ref()
    }

    pub fn preamble(&self, block: BlockId) -> &str {
        &self.nodes[block.0].preamble
    }

    pub fn statements(&self, block: BlockId) -> &[Statement] {
        &self.nodes[block.0].statements
    }

    pub fn root_blocks(&self) -> &[BlockId] {
        &self.roots
    }

    pub fn header_files(&self) -> impl Iterator<Item = &str> {
        self.header_files.iter().map(String::as_str)
    }

    pub fn context_contains(&self, block: BlockId, obj: &str) -> bool {
        self.nodes[block.0].context.contains(obj)
    }

    pub(crate) fn context_of(&self, block: BlockId) -> &HashSet<String> {
        &self.nodes[block.0].context
    }

    pub(crate) fn add_to_context(&mut self, block: BlockId, obj: impl Into<String>) {
        self.nodes[block.0].context.insert(obj.into());
    }

    /// Registers an include required by the program; duplicates collapse,
    /// first registration decides the order.
    pub fn add_header_file(&mut self, file: impl Into<String>) {
        self.header_files.insert(file.into());
    }

    pub(crate) fn add_struct_def(&mut self, def: StructDef) {
        self.struct_defs
            .entry(def.type_name().to_string())
            .or_insert(def);
    }

    /// Finds a block which already has the object fetched, converted and
    /// guarded by its sanity filters. Searches the block itself, then its
    /// already-built children depth-first; unvisited siblings are never
    /// considered.
    pub fn find_block_with_object(&self, block: BlockId, obj: &str) -> Option<BlockId> {
        if self.nodes[block.0].context.contains(obj) {
            return Some(block);
        }

        for stmt in &self.nodes[block.0].statements {
            if let Statement::Block(child) = stmt {
                if let Some(found) = self.find_block_with_object(*child, obj) {
                    return Some(found);
                }
            }
        }

        None
    }

    /// Renders the program to a string.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_to(&mut out, false).expect("string write");
        out
    }

    /// Renders the program into a writer. With `initial_indent` every line
    /// is shifted one unit right, for embedding into a quoted command line.
    pub fn render_to<W: fmt::Write>(&self, w: &mut W, initial_indent: bool) -> fmt::Result {
        let indent = if initial_indent { PROGRAM_INDENT } else { "" };

        let mut sep = "";
        for header_file in &self.header_files {
            writeln!(w, "{indent}#include <{header_file}>")?;
            sep = "\n";
        }

        for struct_def in self.struct_defs.values() {
            w.write_str(sep)?;
            self.render_struct_def(w, struct_def, indent)?;
            sep = "\n\n";
        }

        for block in &self.roots {
            w.write_str(sep)?;
            self.render_block(w, *block, indent)?;
            sep = "\n\n";
        }

        Ok(())
    }

    fn render_struct_def<W: fmt::Write>(
        &self,
        w: &mut W,
        def: &StructDef,
        indent: &str,
    ) -> fmt::Result {
        writeln!(w, "{indent}struct {} {{", def.type_name)?;

        for line in &def.lines {
            if line.is_empty() {
                continue;
            }
            writeln!(w, "{indent}{PROGRAM_INDENT}{line}")?;
        }

        write!(w, "{indent}}}")
    }

    fn render_block<W: fmt::Write>(&self, w: &mut W, block: BlockId, indent: &str) -> fmt::Result {
        let node = &self.nodes[block.0];

        w.write_str(indent)?;
        if !node.preamble.is_empty() {
            w.write_str(&node.preamble)?;
            w.write_char(' ')?;
        }
        w.write_str("{\n")?;

        let block_indent = format!("{indent}{PROGRAM_INDENT}");
        for stmt in &node.statements {
            match stmt {
                Statement::Block(child) => {
                    self.render_block(w, *child, &block_indent)?;
                    w.write_char('\n')?;
                }
                Statement::Text(text) => {
                    for (i, line) in text.split('\n').enumerate() {
                        if i > 0 {
                            w.write_char('\n')?;
                        }
                        w.write_str(&block_indent)?;
                        w.write_str(line)?;
                    }
                    w.write_str(";\n")?;
                }
            }
        }

        write!(w, "{indent}}}")
    }
}
