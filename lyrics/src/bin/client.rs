use clap::{App, Arg};
use lyrics::message::{self, Request, Response};
use mycp::{logging, Stream, TransportKind};
use std::io::{self, BufRead, Write};
use std::net::Ipv4Addr;
use std::str::FromStr;

fn run_command(stream: &Stream, line: &str) -> mycp::Result<()> {
    let mut parts = line.splitn(2, ' ');
    let command = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim();

    let request = match command {
        "get" => {
            let mut fields = rest.splitn(2, '|');
            let author = fields.next().unwrap_or("").trim().to_string();
            let song = fields.next().unwrap_or("").trim().to_string();
            Request::GetSong { author, song }
        }
        "list" => Request::GetList { author: rest.to_string() },
        "add" => {
            let mut fields = rest.splitn(3, '|');
            let author = fields.next().unwrap_or("").trim().to_string();
            let song = fields.next().unwrap_or("").trim().to_string();
            let lyrics = fields.next().unwrap_or("").trim().to_string();
            Request::AddSong { author, song, lyrics }
        }
        "" => return Ok(()),
        other => {
            println!("unknown command: {other} (try: get <author>|<song> | list <author> | add <author>|<song>|<lyrics>)");
            return Ok(());
        }
    };

    message::send_frame(stream, &request.encode())?;
    let response = Response::decode(&message::recv_frame(stream)?)?;
    match response {
        Response::GetSong { lyrics: Some(lyrics) } => println!("{lyrics}"),
        Response::GetSong { lyrics: None } => println!("(no such song)"),
        Response::GetList { songs } => {
            for song in songs {
                println!("{song}");
            }
        }
        Response::AddSong { ok } => println!("{}", if ok { "added" } else { "failed" }),
    }

    Ok(())
}

fn main() {
    let matches = App::new("Lyrics Client")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Interactive client for the lyrics server.")
        .arg(Arg::with_name("HOST").help("Server IPv4 address").required(true))
        .arg(Arg::with_name("PORT").help("Server port").required(true))
        .arg(
            Arg::with_name("transport")
                .long("transport")
                .takes_value(true)
                .possible_values(&["mycp", "fallback"])
                .default_value("fallback")
                .help("Transport substrate to use"),
        )
        .arg(Arg::with_name("verbose").long("verbose").help("Enable trace-level logging"))
        .get_matches();

    let host: Ipv4Addr = matches.value_of("HOST").unwrap().parse().expect("HOST must be an IPv4 address");
    let port: u16 = matches.value_of("PORT").unwrap().parse().expect("PORT must be a u16");
    let transport = TransportKind::from_str(matches.value_of("transport").unwrap()).unwrap();
    let log = logging::init(matches.is_present("verbose"));

    let stream = Stream::connect(transport, host, port, log.clone()).expect("failed to connect");
    logging::info!(log, "connected to lyrics server"; "host" => %host, "port" => port);

    println!("commands: get <author>|<song> | list <author> | add <author>|<song>|<lyrics> | quit");
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush().ok();

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim();
        if line == "quit" || line == "exit" {
            break;
        }

        if let Err(err) = run_command(&stream, line) {
            println!("error: {err}");
        }
    }

    stream.close();
}
