use std::io::{self, Write};

use serde::Serialize;

use crate::coordinator::FetchResult;
use crate::registry::ConnectorSummary;
use crate::store::Asset;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_asset(asset: Option<&Asset>) -> io::Result<()> {
        Self::print_json(&asset)
    }

    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_connectors(connectors: &[ConnectorSummary]) -> io::Result<()> {
        Self::print_json(&connectors)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
