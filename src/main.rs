//! hello-mcp: the smallest server built on mcp-scaffold.
//!
//! Offers one `hello` tool and one `hello_prompt` prompt, over stdio or SSE:
//!
//! ```text
//! hello-mcp --transport stdio
//! hello-mcp --transport sse --port 8080 --greeting Howdy
//! echo '{"jsonrpc":"2.0","method":"help","id":1}' | hello-mcp
//! ```

use std::process::ExitCode;

use mcp_scaffold::framework::Framework;
use mcp_scaffold::hello::HelloWorldModule;

/// Entry point for the hello-mcp server.
fn main() -> ExitCode {
    // License notice (GPLv3 Section 5d); stdout stays free for the protocol
    eprintln!(
        "hello-mcp {}  Copyright (C) 2026  The Embedded Society",
        env!("CARGO_PKG_VERSION")
    );
    eprintln!("This program comes with ABSOLUTELY NO WARRANTY.");
    eprintln!("This is free software, licensed under GPL-3.0-or-later.");
    eprintln!();

    Framework::new(HelloWorldModule::metadata())
        .parameters(HelloWorldModule::parameters())
        .instructions("Call the hello tool with your name to be greeted.")
        .run(|_params| Ok(HelloWorldModule::new()))
}
