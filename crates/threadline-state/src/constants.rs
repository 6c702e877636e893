/// Key under which the Start node records its inbound values in metadata.
pub const START: &str = "__start__";

/// Key under which the End node records the terminal write. Its presence in
/// `metadata.writes` marks a checkpoint terminal.
pub const END: &str = "__end__";
