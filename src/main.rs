use std::process;

use anyhow::Context as _;
use clap::Parser as _;
use console::Term;
use indicatif::ProgressBar;
use regex::Regex;
use tracing_subscriber::EnvFilter;

use devpi_prune::client::DevpiClient;
use devpi_prune::{Package, list_packages_by_index, remove_packages};

#[derive(clap::Parser)]
#[command(version, about)]
struct Options {
    /// URL of the devpi server to operate on
    server: String,

    /// Indices to clean, either `user` (all indices of that user) or
    /// `user/index`
    #[arg(value_name = "user[/index]")]
    index_spec: String,

    /// Name of the packages to delete, `*` wildcards are supported
    package_specification: String,

    /// Assume yes on confirmation questions
    #[arg(long)]
    batch: bool,

    /// Remove only development versions as specified by PEP 440
    #[arg(long)]
    dev_only: bool,

    /// Remove only versions in which the given regular expression can be
    /// found
    #[arg(long, value_name = "REGEX")]
    version_filter: Option<String>,

    /// Temporarily make indices volatile to enable package removal
    #[arg(long)]
    force: bool,

    /// Number of latest versions per index to keep out of the removal set
    #[arg(long, default_value_t = 3, value_name = "N")]
    keep: usize,

    /// The user name to use for authentication. Defaults to the user of the
    /// indices to operate on
    #[arg(long)]
    login: Option<String>,

    /// The password with which to authenticate
    #[arg(long)]
    password: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let options = Options::parse();
    if let Err(err) = real_main(options) {
        eprintln!("{err:#}");
        process::exit(1);
    }
}

fn real_main(options: Options) -> anyhow::Result<()> {
    let owner = options
        .index_spec
        .split('/')
        .next()
        .unwrap_or(&options.index_spec);
    let login_user = options.login.as_deref().unwrap_or(owner).to_string();
    let password = match options.password {
        Some(ref password) => password.clone(),
        None => rpassword::prompt_password(format!("password for {login_user}: "))
            .context("failed to read the password")?,
    };
    let version_filter = options
        .version_filter
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("invalid --version-filter expression")?;

    let mut client = DevpiClient::login(&options.server, &login_user, &password)
        .with_context(|| format!("failed to log in to `{}`", options.server))?;

    let packages_by_index = list_packages_by_index(
        &mut client,
        &options.index_spec,
        &options.package_specification,
        options.dev_only,
        version_filter.as_ref(),
        options.keep,
    )?;

    for (index, packages) in &packages_by_index {
        println!("Packages to be deleted from {index}:");
        for package in sorted(packages.iter()) {
            println!(" * {package}");
        }
    }

    if !options.batch && !confirm()? {
        println!("Aborting...");
        return Ok(());
    }

    for (index, packages) in &packages_by_index {
        println!("Cleaning {index}…");
        let ordered = sorted(packages.iter());
        if ordered.len() > 1 {
            let bar = ProgressBar::new(ordered.len() as u64);
            let result = remove_packages(
                &mut client,
                index,
                bar.wrap_iter(ordered.into_iter()),
                options.force,
            );
            bar.finish_and_clear();
            result?;
        } else {
            remove_packages(&mut client, index, ordered, options.force)?;
        }
    }

    Ok(())
}

fn sorted<'a>(packages: impl Iterator<Item = &'a Package>) -> Vec<&'a Package> {
    let mut ordered: Vec<&Package> = packages.collect();
    ordered.sort();
    ordered
}

fn confirm() -> anyhow::Result<bool> {
    let term = Term::stdout();
    term.write_str("Enter \"yes\" to confirm: ")?;
    let answer = term.read_line()?;
    Ok(answer.trim() == "yes")
}
