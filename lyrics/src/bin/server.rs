use clap::{App, Arg};
use lyrics::message::{self, Request, Response};
use mycp::{logging, Listener, Stream, TransportKind};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::thread;

/// Keyed by `(author, song)`, mirroring `get_song_request`/`add_song_request`'s
/// two-field lookup — two authors may each have a song of the same name.
struct SongStore {
    songs: Mutex<HashMap<(String, String), String>>,
}

impl SongStore {
    fn new() -> SongStore {
        SongStore { songs: Mutex::new(HashMap::new()) }
    }

    fn handle(&self, request: Request) -> Response {
        match request {
            Request::GetSong { author, song } => {
                let lyrics = self.songs.lock().unwrap().get(&(author, song)).cloned();
                Response::GetSong { lyrics }
            }
            Request::GetList { author } => {
                let songs = self
                    .songs
                    .lock()
                    .unwrap()
                    .keys()
                    .filter(|(a, _)| *a == author)
                    .map(|(_, song)| song.clone())
                    .collect();
                Response::GetList { songs }
            }
            Request::AddSong { author, song, lyrics } => {
                self.songs.lock().unwrap().insert((author, song), lyrics);
                Response::AddSong { ok: true }
            }
        }
    }
}

fn serve_client(stream: Stream, store: Arc<SongStore>, log: mycp::logging::Logger) {
    loop {
        let frame = match message::recv_frame(&stream) {
            Ok(frame) => frame,
            Err(err) => {
                logging::debug!(log, "client connection ended"; "error" => %err);
                return;
            }
        };

        let request = match Request::decode(&frame) {
            Ok(request) => request,
            Err(err) => {
                logging::warn!(log, "dropping malformed request"; "error" => %err);
                continue;
            }
        };

        let response = store.handle(request);
        if let Err(err) = message::send_frame(&stream, &response.encode()) {
            logging::warn!(log, "failed to send response"; "error" => %err);
            return;
        }
    }
}

fn main() {
    let matches = App::new("Lyrics Server")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Serves song lyrics over MyCP.")
        .arg(Arg::with_name("PORT").help("Port to listen on").required(true))
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

    let port: u16 = matches.value_of("PORT").unwrap().parse().expect("PORT must be a u16");
    let transport = TransportKind::from_str(matches.value_of("transport").unwrap()).unwrap();
    let log = logging::init(matches.is_present("verbose"));

    logging::info!(log, "starting lyrics server"; "port" => port, "transport" => ?transport);

    let listener = Listener::bind(transport, port, log.clone()).expect("failed to bind listener");
    let store = Arc::new(SongStore::new());

    loop {
        match listener.accept_one_client() {
            Ok(stream) => {
                let store = store.clone();
                let log = log.clone();
                thread::spawn(move || serve_client(stream, store, log));
            }
            Err(err) => {
                logging::error!(log, "accept failed"; "error" => %err);
            }
        }
    }
}
