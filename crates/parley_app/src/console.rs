//! Terminal front end: input commands and event printing.

use parley_network::{Device, ErrorKind, Message, Subscriber};

pub const HELP: &str = "\
Commands:
  <text>          send to every nearby device
  @<name> <text>  send to one device
  /devices        list nearby devices
  /help           show this help
  /quit           leave";

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Empty,
    Devices,
    Help,
    Quit,
    Direct { to: String, text: String },
    Broadcast(String),
    Invalid(String),
}

pub fn parse_command(line: &str) -> Command {
    let line = line.trim();
    if line.is_empty() {
        return Command::Empty;
    }

    if let Some(rest) = line.strip_prefix('@') {
        return match rest.split_once(char::is_whitespace) {
            Some((to, text)) if !to.is_empty() && !text.trim().is_empty() => Command::Direct {
                to: to.to_string(),
                text: text.trim().to_string(),
            },
            _ => Command::Invalid("usage: @<name> <text>".into()),
        };
    }

    match line {
        "/devices" => Command::Devices,
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        other if other.starts_with('/') => Command::Invalid(format!("unknown command {other}")),
        text => Command::Broadcast(text.to_string()),
    }
}

pub fn format_devices(devices: &[Device]) -> String {
    if devices.is_empty() {
        return "(nobody nearby)".to_string();
    }
    let names: Vec<&str> = devices.iter().map(|d| d.name.as_str()).collect();
    format!("nearby: {}", names.join(", "))
}

pub fn format_message(message: &Message) -> String {
    let body = message.message.as_deref().unwrap_or("");
    match &message.json_data {
        Some(data) => format!("<{}> {body} {data}", message.sending_device.name),
        None => format!("<{}> {body}", message.sending_device.name),
    }
}

/// Prints engine events to the terminal.
pub struct ConsolePrinter;

impl Subscriber for ConsolePrinter {
    fn on_service_started(&self, namespace: &str, instance_name: &str) {
        println!("* visible as '{instance_name}' in '{namespace}'");
    }

    fn on_service_failed(&self, namespace: &str, instance_name: &str, error: ErrorKind) {
        eprintln!("* could not advertise '{instance_name}' in '{namespace}': {error}");
    }

    fn on_available_devices(&self, devices: &[Device]) {
        println!("* {}", format_devices(devices));
    }

    fn on_message_received(&self, message: &Message) {
        println!("{}", format_message(message));
    }

    fn on_message_cannot_be_sent_to_devices(&self, messages: &[Message], error: ErrorKind) {
        for message in messages {
            eprintln!(
                "* not delivered to '{}': {error}",
                message.receiving_device.name
            );
        }
    }
}
