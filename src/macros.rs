/// Parse an ELF image
/// # Example
/// ```no_run
/// # use elf_rewriter::parse_elf;
/// // from file
/// let image = parse_elf!("target/app");
/// // from memory
/// # let bytes = vec![];
/// let image = parse_elf!("app", bytes);
/// ```
#[macro_export]
macro_rules! parse_elf {
    ($path:expr) => {
        $crate::ElfImage::from_path($path)
    };
    ($name:expr, $bytes:expr) => {
        $crate::ElfImage::parse($name, $bytes)
    };
}

/// Parse an ELF image and wrap it in an instrumentation engine
/// # Example
/// ```no_run
/// # use elf_rewriter::{instrument_elf, RewriteContext};
/// let engine = instrument_elf!("target/app");
/// let engine = instrument_elf!("target/app", RewriteContext::default());
/// ```
#[macro_export]
macro_rules! instrument_elf {
    ($path:expr) => {
        $crate::ElfImage::from_path($path).and_then(|image| {
            $crate::Instrumentor::new(image, $crate::RewriteContext::default())
        })
    };
    ($path:expr, $ctx:expr) => {
        $crate::ElfImage::from_path($path)
            .and_then(|image| $crate::Instrumentor::new(image, $ctx))
    };
}
