use clap::Parser;

/// List containers recorded in the catalog
#[derive(Parser, Debug)]
pub struct List {}
