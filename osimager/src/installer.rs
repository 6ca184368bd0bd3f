/*!
Installer file generation.

Each `files` entry names installer fragments (kickstart, preseed, autoyast,
autounattend pieces) under the installer root.  The fragments are
concatenated in order, the template engine runs over the combined text, and
the result lands at the entry's destination inside the build workspace.

Before any generation, every `required_files` entry declared by the spec is
checked on disk; a missing one fails the build with the declared description
and download URL so the operator knows what to fetch.
*/

use crate::assembly::AssembledBuild;
use crate::creds::CredentialProvider;
use crate::template::Engine;
use snafu::{ensure, ResultExt};
use std::fs;
use std::path::{Path, PathBuf};

/// Verifies the spec's required files exist under the installer root.
pub fn check_required_files(assembled: &AssembledBuild, installer_dir: &Path) -> Result<()> {
    for required in &assembled.required_files {
        let relative = required.location.as_deref().unwrap_or(&required.file);
        let path = installer_dir.join(relative);
        ensure!(
            path.is_file(),
            error::MissingRequiredFileSnafu {
                file: required.file.clone(),
                description: required.description.clone(),
                url: required.url.clone(),
            }
        );
    }
    Ok(())
}

/// Generates every installer file for the build into its workspace and
/// returns the paths written.
pub fn generate_files(
    assembled: &AssembledBuild,
    installer_dir: &Path,
    creds: Option<&dyn CredentialProvider>,
) -> Result<Vec<PathBuf>> {
    check_required_files(assembled, installer_dir)?;

    let search_domains: Vec<String> = Vec::new();
    let engine = Engine {
        defs: &assembled.defs,
        creds,
        search_domains: &search_domains,
    };

    let mut written = Vec::with_capacity(assembled.files.len());
    for file in &assembled.files {
        // Sources resolve against the installer root, in declared order.
        let mut blob = String::new();
        for source in &file.sources {
            let path = installer_dir.join(source);
            let fragment =
                fs::read_to_string(&path).context(error::FragmentReadSnafu { path: &path })?;
            blob.push_str(&fragment);
        }

        // One substitution pass over the whole concatenation, so markers can
        // span the text of any single fragment.
        let rendered = match engine.render_string(&blob).context(error::TemplateSnafu)? {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };

        let dest = assembled.workspace.join(&file.dest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).context(error::WriteSnafu { path: parent })?;
        }
        fs::write(&dest, rendered).context(error::WriteSnafu { path: &dest })?;
        log::info!(
            "Generated '{}' from {} fragment(s)",
            dest.display(),
            file.sources.len()
        );
        written.push(dest);
    }

    Ok(written)
}

mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display(
            "Required file '{}' is missing: {}.  Download it from {}",
            file,
            description,
            url
        ))]
        MissingRequiredFile {
            file: String,
            description: String,
            url: String,
        },

        #[snafu(display("Failed to read installer fragment '{}': {}", path.display(), source))]
        FragmentRead {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to write installer file '{}': {}", path.display(), source))]
        Write {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("{}", source))]
        Template { source: crate::template::Error },
    }

    impl Error {
        /// The CLI exit code for this failure class.
        pub fn exit_code(&self) -> i32 {
            match self {
                Error::MissingRequiredFile { .. } => 2,
                Error::Template {
                    source: crate::template::Error::Secret { .. },
                }
                | Error::Template {
                    source: crate::template::Error::NoCredentialSource { .. },
                } => 3,
                _ => 1,
            }
        }
    }
}
pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;
