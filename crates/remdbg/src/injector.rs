//! Contract with the external process injector used by `remdbg attach`.
//!
//! Actually landing code inside a foreign process is out of this tool's
//! hands: the user supplies an injector command (ptrace-based or otherwise)
//! and it is invoked as `<injector> <pid> <expression>`, where the
//! expression asks the target's embedded runtime to start its debug server.

use std::process::Command;

use tracing::info;

use crate::errors::CliError;

/// The expression the injector must have the target evaluate.
pub fn bootstrap_expression(port: u16) -> String {
    format!("remdbg::listen(\"127.0.0.1:{}\")", port)
}

/// Run the injector against `pid`. A non-zero exit is a failed injection.
pub fn inject_server_start(injector: &str, pid: u32, port: u16) -> Result<(), CliError> {
    let expression = bootstrap_expression(port);
    info!(
        event = "client.injector.started",
        injector = injector,
        pid = pid,
        port = port,
    );
    let status = Command::new(injector)
        .arg(pid.to_string())
        .arg(&expression)
        .status()
        .map_err(|e| CliError::InjectorFailed(format!("could not run {}: {}", injector, e)))?;
    if !status.success() {
        return Err(CliError::InjectorFailed(format!(
            "{} exited with {}",
            injector, status
        )));
    }
    info!(event = "client.injector.completed", pid = pid);
    Ok(())
}
