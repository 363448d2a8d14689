use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "tcp-tap",
    version,
    about = "Transparent TCP relay that logs and pattern-scans forwarded traffic",
    after_help = concat!(
        "Examples:\n",
        "   tcp-tap 127.0.0.1:8888 1.2.3.4:80\n",
        "   tcp-tap -l log.txt -r '[0-9a-f]{32}' 127.0.0.1:1234 95.34.12.33:80",
    )
)]
pub struct Cli {
    /// Log every relayed chunk to this file (truncated at startup)
    #[arg(short = 'l', value_name = "LOGFILE")]
    pub log_file: Option<PathBuf>,

    /// Print every match of this regular expression to stdout; may repeat
    #[arg(short = 'r', value_name = "PATTERN")]
    pub patterns: Vec<String>,

    /// TOML file with relay tuning settings
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase diagnostic verbosity on stderr (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Address to listen on: host:port, or a bare port on loopback
    pub listen: String,

    /// Upstream address to relay to: host:port
    pub connect: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn patterns_keep_command_line_order() {
        let cli = Cli::try_parse_from([
            "tcp-tap", "-r", "b+", "-l", "out.log", "-r", "a.c", "9000", "host:80",
        ])
        .unwrap();
        assert_eq!(cli.patterns, vec!["b+", "a.c"]);
        assert_eq!(cli.log_file, Some(PathBuf::from("out.log")));
        assert_eq!(cli.listen, "9000");
        assert_eq!(cli.connect, "host:80");
    }

    #[test]
    fn both_addresses_are_required() {
        assert!(Cli::try_parse_from(["tcp-tap", "9000"]).is_err());
        assert!(Cli::try_parse_from(["tcp-tap", "-l"]).is_err());
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::try_parse_from(["tcp-tap", "-vv", "9000", "127.0.0.1:9001"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }
}
