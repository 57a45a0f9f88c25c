//! flowrelay-consumer: queue drain
//!
//! Consumes `analyticsDataPipelineQueue` with an exclusive flow, counts and
//! acknowledges every message.
//!
//! ## Usage
//! `flowrelay-consumer <host:port> <message-vpn> <client-username> [password]`

use std::process::ExitCode;

use flowrelay::pipeline::PipelineKind;
use flowrelay::runtime::{run_program, Program};

const PROGRAM: Program = Program::consumer("T2Q3Consumer");
const INPUT_QUEUE: &str = "analyticsDataPipelineQueue";

#[tokio::main]
async fn main() -> ExitCode {
    run_program(PROGRAM, INPUT_QUEUE, PipelineKind::Drain, std::env::args_os()).await
}
