use clap::Parser;

/// Fetch a rootfs archive into the local image store
#[derive(Parser, Debug)]
pub struct Pull {
    /// Local path or URL of the rootfs archive to pull
    pub src: String,
    /// Name to register the image under (defaults to the source's file stem)
    #[clap(long)]
    pub name: Option<String>,
    /// Verify the archive against this SHA-256 digest before extraction
    #[clap(long)]
    pub sha256: Option<String>,
}
