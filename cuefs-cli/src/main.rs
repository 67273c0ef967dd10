//! cuefs CLI - mount a music library with cue-sheeted albums split into
//! per-track FLAC files.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cuefs::app::{Config, DEFAULT_IGNORE_TAGS};
use cuefs::cache::DEFAULT_MAX_BYTES;
use cuefs::fuse::{self, CueFs};
use cuefs::vpath::{DEFAULT_EXTENSION_PATTERN, DEFAULT_SEPARATOR};

/// Exit codes: 0 clean shutdown, then one per failure class.
const EXIT_CONFIG: i32 = 1;
const EXIT_ROOT_REFUSED: i32 = 2;
const EXIT_MOUNT: i32 = 3;
const EXIT_RUNTIME: i32 = 4;

#[derive(Parser, Debug)]
#[command(
    name = "cuefs",
    version = cuefs::VERSION,
    about = "A read-only FUSE filesystem that splits FLAC+CUE and WAVE+CUE albums into per-track FLAC files"
)]
struct Args {
    /// The root of the directory tree to be mapped
    source_root: PathBuf,

    /// The mount point for the mapped directory tree
    mount_point: PathBuf,

    /// Regular expression identifying file extensions of album files
    #[arg(short = 'e', long = "extension", default_value = DEFAULT_EXTENSION_PATTERN)]
    extension: String,

    /// Separator used inside the names of synthetic track files; must
    /// never occur in regular filenames
    #[arg(short = 's', long = "separator", default_value = DEFAULT_SEPARATOR)]
    separator: String,

    /// Regular expression for tag keys that are not copied to track FLACs
    #[arg(short = 'i', long = "ignore-tags", default_value = DEFAULT_IGNORE_TAGS)]
    ignore_tags: String,

    /// Keep the source album file visible alongside its tracks
    #[arg(short = 'k', long = "keep-album")]
    keep_album: bool,

    /// Number of characters of the track title embedded in filenames
    #[arg(short = 't', long = "title-length", default_value_t = 20)]
    title_length: usize,

    /// Allow running with root permissions; neither necessary nor
    /// recommended
    #[arg(long = "root-allowed")]
    root_allowed: bool,

    /// Artifact cache budget in bytes
    #[arg(long = "cache-size", default_value_t = DEFAULT_MAX_BYTES)]
    cache_size: u64,

    /// Maximum concurrent track materializations (default: CPU cores)
    #[arg(long = "max-builds")]
    max_builds: Option<usize>,

    /// Wall-clock limit in seconds for one materialization
    #[arg(long = "tool-timeout", default_value_t = 120)]
    tool_timeout: u64,

    /// The flac binary used for decoding and encoding
    #[arg(long = "flac-bin", default_value = "flac")]
    flac_bin: PathBuf,

    /// Activate info-level logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Activate debug-level logging
    #[arg(short = 'd', long = "debug")]
    debug: bool,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_CONFIG,
            };
            let _ = e.print();
            process::exit(code);
        }
    };

    init_logging(&args);

    // Running a FUSE layer as root invites mistakes with inherited
    // ownership; refuse unless explicitly overridden.
    if effective_uid_is_root() && !args.root_allowed {
        eprintln!(
            "cuefs does not run with root permissions by default.\n\
             If you are absolutely sure that is what you want, use --root-allowed."
        );
        process::exit(EXIT_ROOT_REFUSED);
    }

    process::exit(run(args));
}

fn init_logging(args: &Args) {
    let directive = if args.debug {
        "cuefs=debug,cuefs_cli=debug"
    } else if args.verbose {
        "cuefs=info,cuefs_cli=info"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn effective_uid_is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

fn run(args: Args) -> i32 {
    if !args.source_root.is_dir() {
        eprintln!(
            "Error: source root '{}' is not a directory",
            args.source_root.display()
        );
        return EXIT_CONFIG;
    }
    if !args.mount_point.is_dir() {
        eprintln!(
            "Error: mount point '{}' is not a directory",
            args.mount_point.display()
        );
        return EXIT_CONFIG;
    }

    let mut config = Config::new(&args.source_root)
        .with_separator(&args.separator)
        .with_title_length(args.title_length)
        .with_extension_pattern(&args.extension)
        .with_ignore_tags(&args.ignore_tags)
        .with_keep_album(args.keep_album)
        .with_cache_bytes(args.cache_size)
        .with_tool_timeout(Duration::from_secs(args.tool_timeout))
        .with_flac_bin(&args.flac_bin);
    if let Some(max_builds) = args.max_builds {
        config = config.with_max_builds(max_builds);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to create runtime: {e}");
            return EXIT_RUNTIME;
        }
    };

    runtime.block_on(async move {
        let fs = match CueFs::new(config) {
            Ok(fs) => fs,
            Err(e) => {
                eprintln!("Error: {e}");
                return EXIT_CONFIG;
            }
        };

        println!("cuefs v{}", cuefs::VERSION);
        println!("  Source:     {}", args.source_root.display());
        println!("  Mountpoint: {}", args.mount_point.display());
        println!("  Separator:  {}", args.separator);
        if args.keep_album {
            println!("  Albums:     kept alongside tracks");
        }
        println!();
        println!("Press Ctrl+C to unmount and exit");

        let mut handle = match fuse::mount(fs, &args.mount_point).await {
            Ok(handle) => handle,
            Err(e) => {
                eprintln!("Error: {e}");
                return EXIT_MOUNT;
            }
        };

        tokio::select! {
            // unmounted externally (fusermount -u) or the session died
            result = &mut handle => match result {
                Ok(()) => {
                    println!("Filesystem unmounted.");
                    0
                }
                Err(e) => {
                    eprintln!("Error: filesystem session failed: {e}");
                    EXIT_RUNTIME
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Received shutdown signal, unmounting...");
                match handle.unmount().await {
                    Ok(()) => {
                        println!("Filesystem unmounted.");
                        0
                    }
                    Err(e) => {
                        eprintln!("Error: unmount failed: {e}");
                        EXIT_RUNTIME
                    }
                }
            }
        }
    })
}
