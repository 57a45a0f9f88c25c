//! flowrelay-processor: queue-to-topic processor
//!
//! ```text
//! [CrewPayAnalyticsSvcQueue] --(exclusive flow)--> upper-case source topic
//!                                                        |
//!                                                        v
//!                                                 [swa/crew/pay]
//! ```
//!
//! ## Usage
//! `flowrelay-processor <host:port> <message-vpn> <client-username> [password]`
//!
//! ## Configuration
//! - FLOWRELAY_LOG: log filter (default: info)
//! - FLOWRELAY__<KEY>: override a tuning setting (see `config::Settings`)

use std::process::ExitCode;

use flowrelay::pipeline::PipelineKind;
use flowrelay::runtime::{run_program, Program};

const PROGRAM: Program = Program::processor("T1Q2_T2Processor");
const INPUT_QUEUE: &str = "CrewPayAnalyticsSvcQueue";
const OUTPUT_TOPIC: &str = "swa/crew/pay";

#[tokio::main]
async fn main() -> ExitCode {
    let kind = PipelineKind::Processor {
        output_topic: OUTPUT_TOPIC.to_string(),
    };
    run_program(PROGRAM, INPUT_QUEUE, kind, std::env::args_os()).await
}
