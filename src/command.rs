//! Works out what a container would actually have executed.
//!
//! Kubernetes lets `command` replace the image `ENTRYPOINT` and `args`
//! replace the image `CMD`, independently of each other.

use std::fmt;

/// Where a piece of the original invocation was declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    ContainerCommand,
    ImageEntrypoint,
    ContainerArgs,
    ImageCmd,
}

impl Origin {
    fn describe(self) -> &'static str {
        match self {
            Origin::ContainerCommand => "Command (ENTRYPOINT) from container",
            Origin::ImageEntrypoint => "Command (ENTRYPOINT) from image",
            Origin::ContainerArgs => "Args (CMD) from container",
            Origin::ImageCmd => "Args (CMD) from image",
        }
    }
}

/// A record of one non-empty source, rendered as a shell comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub origin: Origin,
    pub words: Vec<String>,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "# {}:\n# {}", self.origin.describe(), self.words.join(" "))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedCommand {
    /// Entrypoint slot followed by the args slot.
    pub line: Vec<String>,
    /// One entry per non-empty source, selected or not.
    pub provenance: Vec<Provenance>,
}

impl DerivedCommand {
    /// The invocation as a single space-joined line.
    pub fn invocation(&self) -> String {
        self.line.join(" ")
    }
}

pub fn derive(
    container_command: &[String],
    container_args: &[String],
    image_entrypoint: &[String],
    image_cmd: &[String],
) -> DerivedCommand {
    let entrypoint = if container_command.is_empty() {
        image_entrypoint
    } else {
        container_command
    };

    let args = if container_args.is_empty() {
        image_cmd
    } else {
        container_args
    };

    let provenance = [
        (Origin::ContainerCommand, container_command),
        (Origin::ImageEntrypoint, image_entrypoint),
        (Origin::ContainerArgs, container_args),
        (Origin::ImageCmd, image_cmd),
    ]
    .into_iter()
    .filter(|(_, words)| !words.is_empty())
    .map(|(origin, words)| Provenance {
        origin,
        words: words.to_vec(),
    })
    .collect();

    DerivedCommand {
        line: entrypoint.iter().chain(args).cloned().collect(),
        provenance,
    }
}
