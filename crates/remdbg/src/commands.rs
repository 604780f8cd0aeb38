use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use remdbg_engine::ScriptMode;
use remdbg_server::{load_server_config, make_sure_listening_at_with, RunOptions};
use tracing::info;

use crate::cli::Command;
use crate::client::connect_to_debugger;
use crate::errors::CliError;
use crate::injector::inject_server_start;

fn parse_addr(ip: &str, port: u16) -> Result<SocketAddr, CliError> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| CliError::BadAddress(format!("{}:{}", ip, port)))?;
    Ok(SocketAddr::new(ip, port))
}

pub fn run_command(command: Command) -> Result<(), CliError> {
    match command {
        Command::Connect { ip, port, timeout } => {
            let addr = parse_addr(&ip, port)?;
            connect_to_debugger(addr, Duration::from_secs_f64(timeout))
        }

        Command::Attach {
            pid,
            port,
            timeout,
            injector,
        } => {
            let injector = injector.ok_or(CliError::InjectorUnavailable)?;
            inject_server_start(&injector, pid, port)?;
            let addr = parse_addr(remdbg_protocol::DEFAULT_IP, port)?;
            connect_to_debugger(addr, Duration::from_secs_f64(timeout))
        }

        Command::Run {
            bind,
            port,
            no_post_mortem,
            use_set_trace,
            run_as_module,
            file,
            args,
        } => {
            let addr = parse_addr(&bind, port)?;
            let config = load_server_config()?;
            make_sure_listening_at_with(addr, config)?;
            info!(event = "cli.run.listening", addr = %addr, file = %file);

            let mut argv = vec![file.clone()];
            argv.extend(args);
            remdbg_server::run_with_debugging(RunOptions {
                addr,
                path: file,
                mode: if run_as_module {
                    ScriptMode::Module
                } else {
                    ScriptMode::File
                },
                argv,
                use_set_trace,
                use_post_mortem: !no_post_mortem,
            })?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addr() {
        let addr = parse_addr("127.0.0.1", 3513).unwrap();
        assert_eq!(addr.port(), 3513);
        assert!(parse_addr("not-an-ip", 3513).is_err());
    }

    #[test]
    fn test_attach_without_injector_is_refused() {
        let err = run_command(Command::Attach {
            pid: 1,
            port: 3513,
            timeout: 0.1,
            injector: None,
        })
        .unwrap_err();
        assert!(matches!(err, CliError::InjectorUnavailable));
        assert_eq!(err.exit_code(), 2);
    }
}
