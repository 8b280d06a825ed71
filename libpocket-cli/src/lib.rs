// Subcommands for pocket-docker, one struct per file in the style of
// https://github.com/opencontainers/runtime-tools/blob/master/docs/command-line-interface.md

mod exec;
mod list;
mod logs;
mod pull;
mod remove;
mod run;
mod stop;

pub use {
    exec::Exec, list::List, logs::Logs, pull::Pull, remove::Remove, run::Run, stop::Stop,
};
