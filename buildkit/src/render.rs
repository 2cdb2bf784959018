//! Plain text rendering of build steps, matching `docker build --progress=plain`.
//!
//! Steps are written strictly in display order. A step's header and detail lines are written as soon as
//! they are known, but its terminal line (`DONE`, `CACHED` or `ERROR: ...`) is held back until a later step
//! has started or the stream has ended, since the daemon may still revise how the step finished. Once the
//! terminal line is written the step is sealed and the renderer moves on to the next one.

use crate::tracker::StepTracker;

#[derive(Debug, Default)]
pub struct ProgressRenderer {
    /// Position in the tracker's step list of the step currently being written.
    cursor: usize,
    header_written: bool,
    lines_written: usize,
}

impl ProgressRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the text that became writable since the last call.
    ///
    /// With `end_of_stream` set every remaining step is flushed: finished steps get their terminal line,
    /// steps that never finished are closed with just a blank line.
    pub fn render(&mut self, tracker: &mut StepTracker, end_of_stream: bool) -> String {
        let mut output = String::new();

        while let Some(step) = tracker.steps().get(self.cursor) {
            let index = step.display_index;

            if !self.header_written {
                output.push_str(&format!("#{index} {}\n", step.name));
                self.header_written = true;
            }

            for line in step.detail_lines.iter().skip(self.lines_written) {
                output.push_str(&format!("#{index} {line}\n"));
            }
            self.lines_written = step.detail_lines.len();

            let later_step_started = self.cursor + 1 < tracker.steps().len();

            match step.status.terminal_line() {
                Some(terminal) if later_step_started || end_of_stream => {
                    output.push_str(&format!("#{index} {terminal}\n\n"));
                }
                None if end_of_stream => output.push('\n'),
                _ => break,
            }

            tracker.seal(index);
            self.cursor += 1;
            self.header_written = false;
            self.lines_written = 0;
        }

        output
    }
}
