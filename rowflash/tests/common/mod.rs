#![allow(dead_code)]

use std::{
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    thread,
    time::Duration,
};

/// Answer one connection per response, in order, then stop listening
///
/// Returns the base URL of the server.
pub fn serve(responses: Vec<Vec<u8>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        for response in responses {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);

            let _ = stream.write_all(&response);
        }
    });

    format!("http://{addr}")
}

/// Answer a single connection, writing `response` in `chunk`-sized pieces
/// with `pause` between them, then keep the connection open for `linger`
pub fn serve_slowly(response: Vec<u8>, chunk: usize, pause: Duration, linger: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_request(&mut stream);

        for piece in response.chunks(chunk) {
            if stream.write_all(piece).and_then(|_| stream.flush()).is_err() {
                return;
            }
            thread::sleep(pause);
        }
        thread::sleep(linger);
    });

    format!("http://{addr}")
}

fn read_request(stream: &mut TcpStream) {
    let mut request = Vec::new();
    let mut buffer = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buffer) {
            Ok(0) | Err(_) => break,
            Ok(len) => request.extend_from_slice(&buffer[..len]),
        }
    }
}

pub fn response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    response.extend_from_slice(body);
    response
}

/// A response whose body ends when the connection is closed
pub fn unsized_response(status: &str, content_type: &str, body: &[u8]) -> Vec<u8> {
    let mut response =
        format!("HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n")
            .into_bytes();
    response.extend_from_slice(body);
    response
}
