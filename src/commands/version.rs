//! Command: print version information.

/// Print the converge version to stdout.
pub fn run() {
    println!("converge {}", super::version());
}
