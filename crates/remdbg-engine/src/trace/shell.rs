//! Line-oriented debug shell on the PTY slave.
//!
//! The slave runs in canonical mode while the shell owns it, so the kernel
//! line discipline provides erase/kill editing and echoes keystrokes back
//! through the master to every connected client. Anything that is not a
//! recognised verb is parsed and executed as a script statement in the
//! stopped frame.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};

use nix::sys::termios::{self, InputFlags, LocalFlags, OutputFlags, SetArg};
use tracing::debug;

use crate::interp::Interp;
use crate::trace::TraceEvent;
use crate::traceback::Traceback;

pub const PROMPT: &str = "(rdb) ";

/// What the stopped thread should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Step,
    Next,
    Continue,
    Quit,
}

pub struct Shell {
    reader: BufReader<File>,
    writer: File,
    last_step: Option<Directive>,
}

impl Shell {
    pub fn new(reader: File, writer: File) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer,
            last_step: None,
        }
    }

    /// Put the slave into the canonical mode the shell relies on. ISIG is
    /// cleared so a client's Ctrl-C arrives as a byte instead of vanishing
    /// into a foreground process group the PTY does not have.
    fn ensure_line_mode(&self) {
        let Ok(mut attrs) = termios::tcgetattr(&self.writer) else {
            return;
        };
        attrs
            .local_flags
            .insert(LocalFlags::ICANON | LocalFlags::ECHO | LocalFlags::ECHOE | LocalFlags::ECHOK);
        attrs.local_flags.remove(LocalFlags::ISIG);
        attrs.input_flags.insert(InputFlags::ICRNL);
        attrs
            .output_flags
            .insert(OutputFlags::OPOST | OutputFlags::ONLCR);
        if let Err(e) = termios::tcsetattr(&self.writer, SetArg::TCSANOW, &attrs) {
            debug!(event = "engine.shell.line_mode_failed", error = %e);
        }
    }

    pub fn write_str(&mut self, text: &str) -> std::io::Result<()> {
        self.writer.write_all(text.as_bytes())?;
        self.writer.flush()
    }

    /// Prompt and read one command line. `None` means the terminal is gone.
    fn read_command(&mut self) -> std::io::Result<Option<String>> {
        self.write_str(PROMPT)?;
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }

    fn write_location(&mut self, interp: &Interp) -> std::io::Result<()> {
        let text = format!(
            "> {}({}){}\n",
            interp.file(),
            interp.current_line(),
            interp.current_function()
        );
        self.write_str(&text)
    }

    /// Interactive stop at a trace event. Returns how execution proceeds.
    pub fn interact(
        &mut self,
        interp: &mut Interp,
        event: TraceEvent,
    ) -> std::io::Result<Directive> {
        self.ensure_line_mode();
        match event {
            TraceEvent::Call => self.write_str("--Call--\n")?,
            TraceEvent::Return => self.write_str("--Return--\n")?,
            TraceEvent::Line => {}
        }
        self.write_location(interp)?;
        loop {
            let Some(line) = self.read_command()? else {
                return Ok(Directive::Quit);
            };
            let directive = match line.as_str() {
                // Empty line repeats the last stepping verb.
                "" => self.last_step,
                "s" | "step" => Some(Directive::Step),
                "n" | "next" => Some(Directive::Next),
                "c" | "cont" | "continue" => Some(Directive::Continue),
                "q" | "quit" => Some(Directive::Quit),
                "h" | "help" => {
                    self.write_str(HELP_TEXT)?;
                    None
                }
                "w" | "where" | "bt" => {
                    let listing = interp.format_where();
                    self.write_str(&listing)?;
                    None
                }
                "u" | "up" | "d" | "down" => {
                    self.write_str("*** frame navigation is available in post-mortem\n")?;
                    None
                }
                _ => {
                    self.eval_and_print(interp, &line)?;
                    None
                }
            };
            if let Some(directive) = directive {
                if matches!(directive, Directive::Step | Directive::Next) {
                    self.last_step = Some(directive);
                }
                if directive == Directive::Continue {
                    self.write_str("Resuming program, press Ctrl-C to relaunch debugger.\n")?;
                }
                return Ok(directive);
            }
        }
    }

    fn eval_and_print(&mut self, interp: &mut Interp, line: &str) -> std::io::Result<()> {
        let input = line.strip_prefix("p ").unwrap_or(line);
        let explicit_print = line.starts_with("p ");
        match interp.eval_shell_input(input) {
            Ok(Some(value)) => {
                if explicit_print || value != crate::value::Value::Unit {
                    self.write_str(&format!("{}\n", value.repr()))?;
                }
            }
            Ok(None) => {}
            Err(e) => self.write_str(&format!("*** {}\n", e))?,
        }
        Ok(())
    }

    /// Post-mortem interaction over a captured traceback. `up`/`down` move
    /// between frames; expressions evaluate against the selected frame's
    /// variable snapshot.
    pub fn interact_post_mortem(&mut self, tb: &Traceback) -> std::io::Result<()> {
        self.ensure_line_mode();
        self.write_str(&format!("*** post-mortem: {}\n", tb.message))?;
        if tb.frames.is_empty() {
            self.write_str("(no frames captured)\n")?;
            return Ok(());
        }
        let mut current = tb.frames.len() - 1;
        self.write_frame(tb, current)?;
        loop {
            let Some(line) = self.read_command()? else {
                return Ok(());
            };
            match line.as_str() {
                "" => {}
                "c" | "cont" | "continue" | "q" | "quit" => return Ok(()),
                "u" | "up" => {
                    if current == 0 {
                        self.write_str("*** oldest frame\n")?;
                    } else {
                        current -= 1;
                        self.write_frame(tb, current)?;
                    }
                }
                "d" | "down" => {
                    if current + 1 == tb.frames.len() {
                        self.write_str("*** newest frame\n")?;
                    } else {
                        current += 1;
                        self.write_frame(tb, current)?;
                    }
                }
                "w" | "where" | "bt" => {
                    let mut listing = String::new();
                    for (i, frame) in tb.frames.iter().enumerate() {
                        let marker = if i == current { "> " } else { "  " };
                        listing.push_str(&format!(
                            "{}{}({}){}\n",
                            marker, frame.file, frame.line, frame.function
                        ));
                    }
                    self.write_str(&listing)?;
                }
                "s" | "step" | "n" | "next" => {
                    self.write_str("*** stepping is not available in post-mortem\n")?;
                }
                "h" | "help" => self.write_str(HELP_TEXT)?,
                other => {
                    let frame = &tb.frames[current];
                    let vars: HashMap<String, crate::value::Value> =
                        frame.vars.iter().cloned().collect();
                    let mut scratch = Interp::with_globals(frame.file.clone(), vars);
                    let input = other.strip_prefix("p ").unwrap_or(other);
                    match scratch.eval_shell_input(input) {
                        Ok(Some(value)) => self.write_str(&format!("{}\n", value.repr()))?,
                        Ok(None) => {}
                        Err(e) => self.write_str(&format!("*** {}\n", e))?,
                    }
                }
            }
        }
    }

    fn write_frame(&mut self, tb: &Traceback, index: usize) -> std::io::Result<()> {
        let frame = &tb.frames[index];
        self.write_str(&format!(
            "> {}({}){}\n",
            frame.file, frame.line, frame.function
        ))
    }
}

const HELP_TEXT: &str = "\
Commands:\n\
  s(tep)      step to the next event, entering calls\n\
  n(ext)      step over calls\n\
  c(ontinue)  resume the program\n\
  q(uit)      end the debug session\n\
  p <expr>    evaluate and print\n\
  w(here)     show the call stack\n\
  u(p)/d(own) select frame (post-mortem)\n\
Anything else runs as a statement in the current frame.\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;
    use crate::traceback::TracebackFrame;
    use crate::value::Value;
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    use std::io::Read;
    use std::os::fd::AsRawFd;

    struct Harness {
        shell: Shell,
        master: File,
    }

    /// A PTY stands in for the session terminal: commands are typed through
    /// the master before the shell reads, output is drained afterwards.
    fn harness() -> Harness {
        let pty = nix::pty::openpty(None, None).unwrap();
        let slave_reader = File::from(pty.slave.try_clone().unwrap());
        let slave_writer = File::from(pty.slave);
        Harness {
            shell: Shell::new(slave_reader, slave_writer),
            master: File::from(pty.master),
        }
    }

    impl Harness {
        fn type_input(&mut self, input: &[u8]) {
            self.master.write_all(input).unwrap();
        }

        fn output(&mut self) -> String {
            let flags = fcntl(self.master.as_raw_fd(), FcntlArg::F_GETFL).unwrap();
            let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
            fcntl(self.master.as_raw_fd(), FcntlArg::F_SETFL(flags)).unwrap();
            let mut out = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                match self.master.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => out.extend_from_slice(&buf[..n]),
                }
            }
            String::from_utf8_lossy(&out).into_owned()
        }
    }

    /// An interpreter stopped after `x = 41` on line 1 of shelltest.rsc.
    fn stopped_interp() -> Interp {
        let program = parser::parse("x = 41").unwrap();
        let mut interp = Interp::new("shelltest.rsc");
        interp.run(&program).unwrap();
        interp
    }

    #[test]
    fn test_location_header_and_step() {
        let mut h = harness();
        h.type_input(b"s\n");
        let directive = h
            .shell
            .interact(&mut stopped_interp(), TraceEvent::Line)
            .unwrap();
        assert_eq!(directive, Directive::Step);
        let out = h.output();
        assert!(out.contains("> shelltest.rsc(1)<module>"));
        assert!(out.contains(PROMPT));
    }

    #[test]
    fn test_next_verb_and_empty_line_repeats_it() {
        let mut h = harness();
        let mut interp = stopped_interp();
        h.type_input(b"n\n");
        assert_eq!(
            h.shell.interact(&mut interp, TraceEvent::Line).unwrap(),
            Directive::Next
        );
        // An empty line repeats the last stepping verb.
        h.type_input(b"\n");
        assert_eq!(
            h.shell.interact(&mut interp, TraceEvent::Line).unwrap(),
            Directive::Next
        );
    }

    #[test]
    fn test_empty_line_with_no_history_reprompts() {
        let mut h = harness();
        h.type_input(b"\nq\n");
        assert_eq!(
            h.shell
                .interact(&mut stopped_interp(), TraceEvent::Line)
                .unwrap(),
            Directive::Quit
        );
        // Two prompts: the ignored empty line, then the quit.
        assert_eq!(h.output().matches(PROMPT).count(), 2);
    }

    #[test]
    fn test_continue_prints_resume_message() {
        let mut h = harness();
        h.type_input(b"c\n");
        assert_eq!(
            h.shell
                .interact(&mut stopped_interp(), TraceEvent::Line)
                .unwrap(),
            Directive::Continue
        );
        assert!(h
            .output()
            .contains("Resuming program, press Ctrl-C to relaunch debugger."));
    }

    #[test]
    fn test_help_lists_verbs() {
        let mut h = harness();
        h.type_input(b"h\nq\n");
        assert_eq!(
            h.shell
                .interact(&mut stopped_interp(), TraceEvent::Line)
                .unwrap(),
            Directive::Quit
        );
        let out = h.output();
        assert!(out.contains("step over calls"));
        assert!(out.contains("end the debug session"));
    }

    #[test]
    fn test_call_and_return_markers() {
        let mut h = harness();
        h.type_input(b"s\ns\n");
        let mut interp = stopped_interp();
        h.shell.interact(&mut interp, TraceEvent::Call).unwrap();
        h.shell.interact(&mut interp, TraceEvent::Return).unwrap();
        let out = h.output();
        assert!(out.contains("--Call--"));
        assert!(out.contains("--Return--"));
    }

    #[test]
    fn test_statements_and_p_run_in_the_stopped_frame() {
        let mut h = harness();
        let mut interp = stopped_interp();
        h.type_input(b"x += 1\np x\nx * 2\nq\n");
        assert_eq!(
            h.shell.interact(&mut interp, TraceEvent::Line).unwrap(),
            Directive::Quit
        );
        let out = h.output();
        assert!(out.contains("42"), "p x after the edit: {out:?}");
        assert!(out.contains("84"), "bare expression result: {out:?}");
        assert_eq!(
            interp.globals_ref().borrow().get("x"),
            Some(&Value::Int(42))
        );
    }

    #[test]
    fn test_post_mortem_frame_navigation() {
        let tb = Traceback {
            message: "division by zero".to_string(),
            frames: vec![
                TracebackFrame {
                    function: "<module>".to_string(),
                    file: "shelltest.rsc".to_string(),
                    line: 4,
                    vars: vec![],
                },
                TracebackFrame {
                    function: "divide".to_string(),
                    file: "shelltest.rsc".to_string(),
                    line: 2,
                    vars: vec![
                        ("a".to_string(), Value::Int(1)),
                        ("b".to_string(), Value::Int(0)),
                    ],
                },
            ],
        };
        let mut h = harness();
        h.type_input(b"u\nu\nd\nd\np b\nw\ns\nq\n");
        h.shell.interact_post_mortem(&tb).unwrap();
        let out = h.output();
        assert!(out.contains("*** post-mortem: division by zero"));
        // up: outer frame, then past the top.
        assert!(out.contains("(4)<module>"));
        assert!(out.contains("*** oldest frame"));
        // down: inner frame, then past the bottom.
        assert!(out.contains("*** newest frame"));
        // p evaluates against the selected frame's snapshot.
        assert!(out.contains("0\r\n"));
        // where marks the selected frame.
        assert!(out.contains("> shelltest.rsc(2)divide"));
        assert!(out.contains("*** stepping is not available in post-mortem"));
    }
}
