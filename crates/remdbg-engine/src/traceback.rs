use crate::value::Value;

/// One captured frame, outermost first in [`Traceback::frames`].
#[derive(Debug, Clone)]
pub struct TracebackFrame {
    pub function: String,
    pub file: String,
    pub line: u32,
    /// Snapshot of the frame's variables at capture time.
    pub vars: Vec<(String, Value)>,
}

/// Owned snapshot of a script failure: the message plus the call stack at
/// the point of the raise. Safe to carry across threads and to keep after
/// the interpreter that produced it is gone.
#[derive(Debug, Clone)]
pub struct Traceback {
    pub message: String,
    pub frames: Vec<TracebackFrame>,
}

impl Traceback {
    /// Render in the classic most-recent-call-last layout.
    pub fn render(&self) -> String {
        let mut out = String::from("Traceback (most recent call last):\n");
        for frame in &self.frames {
            out.push_str(&format!(
                "  File \"{}\", line {}, in {}\n",
                frame.file, frame.line, frame.function
            ));
        }
        out.push_str(&self.message);
        out.push('\n');
        out
    }

    /// Innermost frame, if any.
    pub fn innermost(&self) -> Option<&TracebackFrame> {
        self.frames.last()
    }
}
