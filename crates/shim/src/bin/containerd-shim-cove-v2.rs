// Copyright (c) 2025 The cove Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use shim::{Args, ShimExecutor};

#[derive(Debug)]
enum Action {
    Run(Args),
    Start(Args),
    Delete(Args),
    Error(String),
    Help,
    Version,
}

fn parse_args(args: &[OsString]) -> Action {
    let mut help = false;
    let mut version = false;
    let mut shim_args = Args::default();

    // Crate `go_flag` is used to stay compatible with the go flag syntax
    // the supervisor invokes shims with.
    match go_flag::parse_args_with_warnings::<String, _, _>(&args[1..], None, |flags| {
        flags.add_flag("address", &mut shim_args.address);
        flags.add_flag("bundle", &mut shim_args.bundle);
        flags.add_flag("debug", &mut shim_args.debug);
        flags.add_flag("id", &mut shim_args.id);
        flags.add_flag("namespace", &mut shim_args.namespace);
        flags.add_flag("help", &mut help);
        flags.add_flag("version", &mut version);
    }) {
        Ok(rest_args) => {
            if help {
                Action::Help
            } else if version {
                Action::Version
            } else if rest_args.is_empty() {
                Action::Run(shim_args)
            } else if rest_args[0] == "start" {
                Action::Start(shim_args)
            } else if rest_args[0] == "delete" {
                Action::Delete(shim_args)
            } else {
                Action::Error(format!("unknown parameters: {}", rest_args.join(" ")))
            }
        }

        Err(e) => Action::Error(format!("{}", e)),
    }
}

fn show_help(cmd: &OsStr) {
    let path = PathBuf::from(cmd);
    let name = path
        .file_name()
        .and_then(|v| v.to_str())
        .unwrap_or("containerd-shim-cove-v2");

    eprintln!(
        r#"Usage of {}:
    -address string
          grpc address back to main containerd
    -bundle string
          path to the bundle if not containerd workdir
    -debug
          enable debug output in logs
    -id string
          id of the task
    -namespace string
          namespace that owns the shim
    -help
          show help
    -version
          show version
"#,
        name
    );
}

fn show_version() {
    eprintln!("containerd-shim-cove-v2 version {}", env!("CARGO_PKG_VERSION"));
}

fn main() {
    let args = std::env::args_os().collect::<Vec<_>>();
    if args.is_empty() {
        eprintln!("invalid commandline arguments");
        std::process::exit(1);
    }

    let result = match parse_args(&args) {
        Action::Start(args) => ShimExecutor::new(args).start(),
        Action::Delete(args) => ShimExecutor::new(args).delete(),
        Action::Run(args) => ShimExecutor::new(args).run(),
        Action::Error(estr) => {
            eprintln!("{}", estr);
            show_help(&args[0]);
            std::process::exit(1);
        }
        Action::Help => {
            show_help(&args[0]);
            return;
        }
        Action::Version => {
            show_version();
            return;
        }
    };

    if let Err(err) = result {
        eprintln!("containerd-shim-cove-v2: {:?}", err);
        std::process::exit(1);
    }
}
