use std::fmt;

/// Logical IPC channels between the router and its consumer processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelType {
    RouterToCentral,
    CentralToRouter,
    RouterToTelemetry,
    TelemetryToRouter,
    RouterToRc,
    RcToRouter,
    RouterToCommands,
    CommandsToRouter,
}

impl ChannelType {
    pub const ALL: [ChannelType; 8] = [
        ChannelType::RouterToCentral,
        ChannelType::CentralToRouter,
        ChannelType::RouterToTelemetry,
        ChannelType::TelemetryToRouter,
        ChannelType::RouterToRc,
        ChannelType::RcToRouter,
        ChannelType::RouterToCommands,
        ChannelType::CommandsToRouter,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ChannelType::RouterToCentral => "ROUTER-TO-CENTRAL",
            ChannelType::CentralToRouter => "CENTRAL-TO-ROUTER",
            ChannelType::RouterToTelemetry => "ROUTER-TO-TELEMETRY",
            ChannelType::TelemetryToRouter => "TELEMETRY-TO-ROUTER",
            ChannelType::RouterToRc => "ROUTER-TO-RC",
            ChannelType::RcToRouter => "RC-TO-ROUTER",
            ChannelType::RouterToCommands => "ROUTER-TO-COMMANDS",
            ChannelType::CommandsToRouter => "COMMANDS-TO-ROUTER",
        }
    }

    /// File name of the named pipe backing this channel.
    pub fn fifo_name(self) -> &'static str {
        match self {
            ChannelType::RouterToCentral => "fiforoutercentral",
            ChannelType::CentralToRouter => "fifocentralrouter",
            ChannelType::RouterToTelemetry => "fiforoutertelemetry",
            ChannelType::TelemetryToRouter => "fifotelemetryrouter",
            ChannelType::RouterToRc => "fiforouterrc",
            ChannelType::RcToRouter => "fiforcrouter",
            ChannelType::RouterToCommands => "fiforoutercommands",
            ChannelType::CommandsToRouter => "fifocommandsrouter",
        }
    }

    /// The router writes this channel and a consumer process reads it.
    pub fn is_router_output(self) -> bool {
        matches!(
            self,
            ChannelType::RouterToCentral
                | ChannelType::RouterToTelemetry
                | ChannelType::RouterToRc
                | ChannelType::RouterToCommands
        )
    }

    /// The channel carrying traffic the other way between the same two processes.
    pub fn reverse(self) -> ChannelType {
        match self {
            ChannelType::RouterToCentral => ChannelType::CentralToRouter,
            ChannelType::CentralToRouter => ChannelType::RouterToCentral,
            ChannelType::RouterToTelemetry => ChannelType::TelemetryToRouter,
            ChannelType::TelemetryToRouter => ChannelType::RouterToTelemetry,
            ChannelType::RouterToRc => ChannelType::RcToRouter,
            ChannelType::RcToRouter => ChannelType::RouterToRc,
            ChannelType::RouterToCommands => ChannelType::CommandsToRouter,
            ChannelType::CommandsToRouter => ChannelType::RouterToCommands,
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_channel_pairs() {
        let fifos: HashSet<_> = ChannelType::ALL.iter().map(|c| c.fifo_name()).collect();
        assert_eq!(fifos.len(), 8);
        for channel in ChannelType::ALL {
            assert_eq!(channel.reverse().reverse(), channel);
            assert_ne!(channel.is_router_output(), channel.reverse().is_router_output());
        }
    }
}
