/// The command vocabulary of the control protocol, with the exact wire literals and the
///  positive / negative response literal for each command.
///
/// This is the process-wide read-only token table: the literals never change at runtime, so
///  there is no mutable global state behind the accessors.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Command {
    Connect,
    Disconnect,
    Select,
    Start,
    Pause,
    Stop,
    ClientPort,
    ServerPort,
    Channels,
    DataType,
    /// server -> client push, sent when a channel's data type label changes
    ChangedDataType,
}

impl Command {
    pub const ALL: [Command; 11] = [
        Command::Connect,
        Command::Disconnect,
        Command::Select,
        Command::Start,
        Command::Pause,
        Command::Stop,
        Command::ClientPort,
        Command::ServerPort,
        Command::Channels,
        Command::DataType,
        Command::ChangedDataType,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "connect",
            Command::Disconnect => "disconnect",
            Command::Select => "select",
            Command::Start => "start",
            Command::Pause => "pause",
            Command::Stop => "stop",
            Command::ClientPort => "clientPort",
            Command::ServerPort => "serverPort",
            Command::Channels => "channels",
            Command::DataType => "datatype",
            Command::ChangedDataType => "changeddatatype",
        }
    }

    pub const fn positive_response(self) -> &'static str {
        match self {
            Command::Connect => "connected",
            Command::Disconnect => "disconnected",
            Command::Select => "selected",
            Command::Start => "started",
            Command::Pause => "paused",
            Command::Stop => "stopped",
            Command::ClientPort => "accepted",
            Command::ServerPort => "accepted",
            Command::Channels => "channels",
            Command::DataType => "datatype",
            Command::ChangedDataType => "accepted",
        }
    }

    pub const fn negative_response(self) -> &'static str {
        match self {
            Command::Connect => "notconnected",
            Command::Disconnect => "notdisconnected",
            Command::Select => "notselected",
            Command::Start => "notstarted",
            Command::Pause => "notpaused",
            Command::Stop => "notstopped",
            Command::ClientPort => "notaccepted",
            Command::ServerPort => "notaccepted",
            Command::Channels => "nochannels",
            Command::DataType => "nodatatype",
            Command::ChangedDataType => "notaccepted",
        }
    }

    pub fn lookup(message: &str) -> Option<Command> {
        Self::ALL.iter()
            .copied()
            .find(|c| c.as_str() == message)
    }
}

/// separator between channel names in the `channels` response value
pub const CHANNEL_LIST_SEPARATOR: &str = ";";

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::connect(Command::Connect, "connect", "connected", "notconnected")]
    #[case::disconnect(Command::Disconnect, "disconnect", "disconnected", "notdisconnected")]
    #[case::select(Command::Select, "select", "selected", "notselected")]
    #[case::start(Command::Start, "start", "started", "notstarted")]
    #[case::pause(Command::Pause, "pause", "paused", "notpaused")]
    #[case::stop(Command::Stop, "stop", "stopped", "notstopped")]
    #[case::client_port(Command::ClientPort, "clientPort", "accepted", "notaccepted")]
    #[case::server_port(Command::ServerPort, "serverPort", "accepted", "notaccepted")]
    #[case::channels(Command::Channels, "channels", "channels", "nochannels")]
    #[case::datatype(Command::DataType, "datatype", "datatype", "nodatatype")]
    #[case::changed_data_type(Command::ChangedDataType, "changeddatatype", "accepted", "notaccepted")]
    fn test_vocabulary(#[case] command: Command, #[case] literal: &str, #[case] positive: &str, #[case] negative: &str) {
        assert_eq!(command.as_str(), literal);
        assert_eq!(command.positive_response(), positive);
        assert_eq!(command.negative_response(), negative);
        assert_eq!(Command::lookup(literal), Some(command));
    }

    #[rstest]
    #[case::unknown("frobnicate")]
    #[case::empty("")]
    #[case::wrong_case("Connect")]
    fn test_lookup_unknown(#[case] message: &str) {
        assert_eq!(Command::lookup(message), None);
    }
}
