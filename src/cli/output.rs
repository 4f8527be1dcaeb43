//! Output formatting for CLI commands.

use serde::{Deserialize, Serialize};

use crate::cli::args::{OutputFormat, SegpatchArgs};
use crate::error::Result;
use crate::lexical::core::doc_delta::DocDelta;
use crate::lexical::core::term_key::TermKey;

/// One document event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEntry {
    pub doc_id: u32,
    pub op: String,
}

impl From<DocDelta> for DeltaEntry {
    fn from(delta: DocDelta) -> Self {
        DeltaEntry {
            doc_id: delta.doc_id(),
            op: if delta.is_delete() { "remove" } else { "add" }.to_string(),
        }
    }
}

/// Events of one term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermEntry {
    pub term: String,
    pub deltas: Vec<DeltaEntry>,
}

impl TermEntry {
    pub fn new(term: TermKey, deltas: &[DocDelta]) -> Self {
        TermEntry {
            term: term.to_string(),
            deltas: deltas.iter().copied().map(DeltaEntry::from).collect(),
        }
    }
}

/// Result structure for `inspect`.
#[derive(Debug, Serialize, Deserialize)]
pub struct PatchFileReport {
    pub file: String,
    pub src_segment: u32,
    pub dst_segment: u32,
    pub non_null_term_count: u64,
    pub has_null_term: bool,
    pub item_count: u64,
    pub terms: Vec<TermEntry>,
    pub truncated: bool,
}

/// Result structure for `merge`.
#[derive(Debug, Serialize, Deserialize)]
pub struct MergeReport {
    pub dst_segment: Option<u32>,
    pub sources: Vec<String>,
    pub term_count: usize,
    pub item_count: u64,
    pub terms: Vec<TermEntry>,
    pub truncated: bool,
}

/// Human readable rendering of a result.
pub trait HumanOutput {
    fn print_human(&self, args: &SegpatchArgs);
}

impl HumanOutput for PatchFileReport {
    fn print_human(&self, args: &SegpatchArgs) {
        println!("Patch File: {}", self.file);
        println!("══════════");
        println!("Source segment:      {}", self.src_segment);
        println!("Destination segment: {}", self.dst_segment);
        println!("Terms:               {}", self.non_null_term_count);
        println!("Null term:           {}", self.has_null_term);
        println!("Document events:     {}", self.item_count);
        print_terms(&self.terms, self.truncated, args);
    }
}

impl HumanOutput for MergeReport {
    fn print_human(&self, args: &SegpatchArgs) {
        println!("Merged Patches:");
        println!("═══════════════");
        match self.dst_segment {
            Some(dst) => println!("Destination segment: {dst}"),
            None => println!("Destination segment: -"),
        }
        for source in &self.sources {
            println!("  {source}");
        }
        println!("Terms:               {}", self.term_count);
        println!("Document events:     {}", self.item_count);
        print_terms(&self.terms, self.truncated, args);
    }
}

fn print_terms(terms: &[TermEntry], truncated: bool, args: &SegpatchArgs) {
    if terms.is_empty() {
        return;
    }

    println!();
    for term in terms {
        let events: Vec<String> = term
            .deltas
            .iter()
            .map(|delta| {
                let sign = if delta.op == "remove" { '-' } else { '+' };
                format!("{sign}{}", delta.doc_id)
            })
            .collect();
        println!("{:>20}: {}", term.term, events.join(" "));
    }
    if truncated && args.verbosity() > 0 {
        println!("... (truncated, raise --limit to see more)");
    }
}

/// Output a result in the requested format.
pub fn output_result<T: Serialize + HumanOutput>(
    message: &str,
    result: &T,
    args: &SegpatchArgs,
) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => {
            if args.verbosity() > 1 {
                println!("{message}");
                println!();
            }
            result.print_human(args);
            Ok(())
        }
        OutputFormat::Json => output_json(result, args),
    }
}

/// Output in JSON format.
fn output_json<T: Serialize>(result: &T, args: &SegpatchArgs) -> Result<()> {
    let json = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };

    println!("{json}");
    Ok(())
}
