mod catalog;
mod checksum;
mod delta;
mod expand;
mod manifest;
mod paths;

pub use catalog::{AppCatalog, UpdatePackage};
pub use checksum::{crc32_of_file, sha256_hex_of_file};
pub use delta::{decode_delta, encode_delta};
pub use expand::expand;
pub use manifest::{
    ExecuteSpec, FileOperation, RegHive, RegOpKind, RegValueKind, RegistryOperation, ShortcutSpec,
    UpdateManifest, MANIFEST_FILE_NAME,
};
pub use paths::{split_tagged, InstallTargets, TargetClass};

#[cfg(test)]
mod tests;
