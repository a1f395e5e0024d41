//! Patterns command - lists the pattern library and the category taxonomy

use std::fmt::Write;
use std::path::Path;

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use malgraph_core::category::Category;
use malgraph_core::pattern::{Pattern, PatternEdge, PatternLibrary};

use super::{load_config, load_patterns};

#[derive(Args, Debug)]
pub struct PatternsArgs {
    /// Only show patterns involving this category id
    #[arg(long, value_name = "ID")]
    pub category: Option<u8>,
}

impl PatternsArgs {
    pub fn run(&self, config_path: Option<&Path>) -> Result<()> {
        let config = load_config(config_path)?;
        let library = load_patterns(&config)?;
        print!("{}", self.render(&library)?);
        Ok(())
    }

    fn render(&self, library: &PatternLibrary) -> Result<String> {
        let filter = match self.category {
            Some(id) => match Category::from_id(id) {
                Some(category) => Some(category),
                None => anyhow::bail!("Unknown category {}", id),
            },
            None => None,
        };

        let mut out = String::new();
        let _ = writeln!(out, "{}", "Patterns".bold().underline());
        for pattern in library
            .iter()
            .filter(|p| filter.is_none_or(|c| p.categories().contains(&c)))
        {
            let _ = writeln!(
                out,
                "  {} {}",
                format!("[{}]", pattern.behavior()).cyan(),
                pattern.description()
            );
            let _ = writeln!(out, "      {}", shape(pattern).dimmed());
        }

        let _ = writeln!(out);
        let _ = writeln!(out, "{}", "Categories".bold().underline());
        for category in Category::all().filter(|c| filter.is_none_or(|f| f == *c)) {
            let _ = writeln!(out, "  {:>2}  {}", category.id(), category.description());
        }
        Ok(out)
    }
}

/// `12 -DDG-> 20, 20 -CFG-> 37`, or the single key category.
fn shape(pattern: &Pattern) -> String {
    if let PatternEdge::Single(head) = pattern.key() {
        return head.id().to_string();
    }
    pattern
        .triples()
        .iter()
        .map(|t| format!("{} -{}-> {}", t.head.id(), t.kind.as_str(), t.tail.id()))
        .collect::<Vec<_>>()
        .join(", ")
}
