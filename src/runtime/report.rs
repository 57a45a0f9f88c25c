//! Console lines printed by the run loop.

use super::counters::Sample;

/// Label printed in front of every status line.
pub const API: &str = "AMQP";

/// Which counters a program reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Processor,
    Consumer,
}

/// Name and shape of a running program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Program {
    pub name: &'static str,
    pub shape: Shape,
}

impl Program {
    pub const fn processor(name: &'static str) -> Self {
        Self {
            name,
            shape: Shape::Processor,
        }
    }

    pub const fn consumer(name: &'static str) -> Self {
        Self {
            name,
            shape: Shape::Consumer,
        }
    }

    pub fn usage(&self) -> String {
        format!(
            "Usage: {} <host:port> <message-vpn> <client-username> [password]",
            self.name
        )
    }

    pub fn initializing(&self) -> String {
        format!("{} {} initializing...", API, self.name)
    }

    pub fn running(&self) -> String {
        format!(
            "{} {} connected, and running. Press [ENTER] to quit.",
            API, self.name
        )
    }

    pub fn status_line(&self, sample: &Sample) -> String {
        match self.shape {
            Shape::Processor => format!(
                "{} {} Received msgs/s: {} Sent msgs/s: {}",
                API,
                self.name,
                group_thousands(sample.received),
                group_thousands(sample.sent)
            ),
            Shape::Consumer => format!(
                "{} {} Received msgs/s: {}",
                API,
                self.name,
                group_thousands(sample.received)
            ),
        }
    }

    pub fn discard_warning(&self) -> String {
        format!(
            "*** Egress discard detected *** : {} unable to keep up with full message rate",
            self.name
        )
    }
}

/// Final line printed after the session is closed.
pub const QUITTING: &str = "Main thread quitting.";

/// Format a count with comma thousands separators.
pub fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
