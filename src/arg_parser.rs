use std::{io, path::PathBuf};

use argparse::{ArgumentParser, Print, Store, StoreOption, StoreTrue};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArgsOptions {
    // Overrides the document path under the user configuration root
    pub config_file_path: Option<PathBuf>,

    pub gpu: u32,
    pub simulate: bool,
    pub simulated_gpus: u32,

    pub list: bool,
    pub apply_profile: Option<String>,
}

impl ArgsOptions {
    // Parse the process arguments, exit on --help, --version or bad input
    pub fn parse() -> Self {
        let args = std::env::args().collect();

        Self::parse_from(args, &mut io::stdout(), &mut io::stderr())
            .unwrap_or_else(|code| std::process::exit(code))
    }

    // Parse the given arguments, the first one being the program name.
    // Return the exit code on --help, --version or invalid arguments
    pub fn parse_from(
        args: Vec<String>,
        stdout: &mut dyn io::Write,
        stderr: &mut dyn io::Write,
    ) -> Result<Self, i32> {
        let mut options = ArgsOptions {
            simulated_gpus: 1,
            ..Default::default()
        };

        {
            let mut parser = ArgumentParser::new();
            parser.set_description(
                "Tune NVIDIA GPU clock offsets and fans, manage per GPU \
                 profiles and monitor the GPU",
            );

            // Configuration file path
            parser.refer(&mut options.config_file_path).add_option(
                &["-c", "--config"],
                StoreOption,
                "The file path of the profiles document",
            );

            parser.refer(&mut options.gpu).add_option(
                &["-g", "--gpu"],
                Store,
                "Ordinal of the GPU to monitor",
            );

            parser.refer(&mut options.simulate).add_option(
                &["--simulate"],
                StoreTrue,
                "Drive an in-memory simulated GPU instead of the hardware",
            );

            parser.refer(&mut options.simulated_gpus).add_option(
                &["--simulated-gpus"],
                Store,
                "Number of GPUs to simulate with --simulate",
            );

            parser.refer(&mut options.list).add_option(
                &["-l", "--list"],
                StoreTrue,
                "Print the GPUs, their settings and profiles, then exit",
            );

            parser.refer(&mut options.apply_profile).add_option(
                &["-a", "--apply"],
                StoreOption,
                "Apply the named profile to the monitored GPU",
            );

            // Show the program version
            parser.add_option(
                &["-V", "--version"],
                Print(env!("CARGO_PKG_VERSION").to_string()),
                "Show the program version",
            );

            parser.parse(args, stdout, stderr)?;
        }

        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ArgsOptions, i32> {
        let args = args.iter().map(|a| a.to_string()).collect();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        ArgsOptions::parse_from(args, &mut stdout, &mut stderr)
    }

    #[test]
    fn defaults_without_arguments() {
        let options = parse(&["nvoverdrive"]).unwrap();

        assert_eq!(options.config_file_path, None);
        assert_eq!(options.gpu, 0);
        assert!(!options.simulate);
        assert_eq!(options.simulated_gpus, 1);
        assert!(!options.list);
        assert_eq!(options.apply_profile, None);
    }

    #[test]
    fn all_options_are_parsed() {
        let options = parse(&[
            "nvoverdrive",
            "-c",
            "/tmp/profiles.config",
            "--gpu",
            "1",
            "--simulate",
            "--simulated-gpus",
            "2",
            "--list",
            "--apply",
            "Gaming",
        ])
        .unwrap();

        assert_eq!(
            options.config_file_path,
            Some(PathBuf::from("/tmp/profiles.config"))
        );
        assert_eq!(options.gpu, 1);
        assert!(options.simulate);
        assert_eq!(options.simulated_gpus, 2);
        assert!(options.list);
        assert_eq!(options.apply_profile.as_deref(), Some("Gaming"));
    }

    #[test]
    fn invalid_ordinal_is_rejected() {
        assert_eq!(parse(&["nvoverdrive", "--gpu", "first"]), Err(2));
    }
}
