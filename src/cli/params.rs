//! Params command implementation.

use clap::Args;
use vmfixture::{Params, Result};

/// Show the effective parameters.
#[derive(Args, Debug)]
pub struct ParamsCmd {
    /// Show the view scoped to an object (VM, image or NIC name).
    #[arg(long)]
    pub object: Option<String>,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl ParamsCmd {
    /// Execute the params command.
    pub fn run(&self, params: &Params) -> Result<()> {
        let view = match &self.object {
            Some(name) => params.object_params(name),
            None => params.clone(),
        };

        if self.json {
            let json = serde_json::to_string_pretty(&view)
                .map_err(|e| vmfixture::Error::config(e.to_string()))?;
            println!("{}", json);
            return Ok(());
        }

        if view.is_empty() {
            println!("No parameters set");
            return Ok(());
        }

        let width = view.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (key, value) in view.iter() {
            println!("{:<width$} = {}", key, value, width = width);
        }
        Ok(())
    }
}
