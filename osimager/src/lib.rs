/*!
OSImager builds virtual machine images by driving Packer with declaratively
composed configuration.

A build target like `vmware/lab/rhel-9.5-x86_64` names a platform, a location,
and a spec.  The library resolves those layers into a single accumulator,
substitutes a marker language over the result, assembles a Packer input
document, and supervises the Packer child process.

The major pieces:

* [`config`] loads and merges platform, location, and spec layers, including
  recursive `include` chains and conditional `*_specific` overrides.
* [`template`] is the marker substitution engine, with type preservation,
  secret retrieval, crypt-style password hashing, and expression evaluation.
* [`index`] expands spec version declarations into a `(dist, version, arch)`
  lookup table, cached on disk.
* [`creds`] retrieves secrets from a Vault server or a local secrets file.
* [`assembly`] turns a resolved accumulator into a Packer input document.
* [`installer`] generates installer files (kickstart, preseed, ...) from
  fragments into the build workspace.
* [`orchestrator`] owns the build queue, worker pool, and Packer supervision.
* [`events`] fans build status, progress, and log events out to subscribers.
*/

#![deny(rust_2018_idioms)]

pub mod assembly;
pub mod config;
pub mod creds;
pub mod events;
pub mod index;
pub mod installer;
pub mod orchestrator;
pub mod template;
