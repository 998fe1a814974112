// cellar/src/cli/list.rs

use std::collections::BTreeMap;

use cellar_common::config::Config;
use cellar_common::error::Result;
use cellar_common::keg::{InstalledKeg, KegRegistry};
use cellar_common::model::artifact::{SourceKind, VerificationStatus};
use clap::Args;
use colored::Colorize;
use prettytable::{format, Cell, Row, Table};

#[derive(Args, Debug)]
pub struct List {
    /// Show all installed versions, not just the latest for each name
    #[arg(long)]
    pub all: bool,
}

impl List {
    pub async fn run(&self, config: &Config) -> Result<()> {
        let registry = KegRegistry::new(config.clone());
        let installed = registry.list_installed_kegs()?;
        let kegs: Vec<InstalledKeg> = if self.all {
            installed
        } else {
            // Versions come back oldest first per name.
            let mut latest = BTreeMap::new();
            for keg in installed {
                latest.insert(keg.name.clone(), keg);
            }
            latest.into_values().collect()
        };

        if kegs.is_empty() {
            println!("{}", "0 formulas installed".yellow());
            return Ok(());
        }

        let mut table = Table::new();
        table.set_format(*format::consts::FORMAT_NO_BORDER_LINE_SEPARATOR);
        table.add_row(Row::new(vec![
            Cell::new("Name").style_spec("b"),
            Cell::new("Version").style_spec("b"),
            Cell::new("Source").style_spec("b"),
            Cell::new("Verified").style_spec("b"),
        ]));
        for keg in &kegs {
            let (source, verified) = match keg.receipt() {
                Ok(receipt) => {
                    let source = match receipt.source.kind {
                        SourceKind::Archive => "archive",
                        SourceKind::Head => "head",
                    };
                    let verified = match receipt.verification {
                        VerificationStatus::Passed => Cell::new("✔").style_spec("Fg"),
                        VerificationStatus::NotRun => Cell::new("-"),
                        VerificationStatus::Failed { .. } => Cell::new("✗").style_spec("Fr"),
                    };
                    (source, verified)
                }
                Err(_) => ("?", Cell::new("?").style_spec("Fy")),
            };
            table.add_row(Row::new(vec![
                Cell::new(&keg.name).style_spec("Fb"),
                Cell::new(&keg.version_str),
                Cell::new(source),
                verified,
            ]));
        }
        table.printstd();
        println!("{}", format!("{} formulas installed", kegs.len()).bold());
        Ok(())
    }
}
