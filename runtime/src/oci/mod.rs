//! OCI image support.
//!
//! Reading and writing OCI image layouts, the local image store, registry
//! pulls, `docker save` conversion and layer application.
//!
//! ```text
//!  image/
//!  ├── oci-layout           (OCI layout marker)
//!  ├── index.json           (Image index)
//!  ├── manifest.json        (Docker load manifest, written layouts only)
//!  └── blobs/
//!      └── sha256/
//!          ├── <manifest>   (Image manifest)
//!          ├── <config>     (Image configuration)
//!          └── <layers>     (Filesystem layers)
//! ```

pub mod archive;
pub mod digest;
pub mod docker_archive;
mod image;
pub mod layers;
pub mod layout;
mod pull;
pub mod reference;
pub mod registry;
pub mod store;

pub use image::{LayerInfo, OciImage, OciImageConfig};
pub use layers::{apply_layer, apply_layer_protected, Compression, LayerStats};
pub use layout::{BlobRef, LayoutWriter, WrittenImage};
pub use pull::ImagePuller;
pub use reference::ImageReference;
pub use registry::{RegistryAuth, RegistryPuller};
pub use store::{ImageStore, StoredImage};
