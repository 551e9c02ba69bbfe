use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Full-duplex byte relay between two streams.
///
/// Copies `a -> b` and `b -> a` concurrently. Whichever direction finishes
/// first (EOF or transport error) shuts down its destination, which cascades
/// EOF to the opposite direction. Returns once both halves are done.
///
/// This function never reports an error: EOFs and transport failures are the
/// normal way a relay ends, and callers must not treat its return as a
/// failure signal.
pub async fn relay(a: TcpStream, b: TcpStream) {
    let (mut a_read, mut a_write) = a.into_split();
    let (mut b_read, mut b_write) = b.into_split();

    let a_to_b = async {
        let _ = tokio::io::copy(&mut a_read, &mut b_write).await;
        let _ = b_write.shutdown().await;
    };
    let b_to_a = async {
        let _ = tokio::io::copy(&mut b_read, &mut a_write).await;
        let _ = a_write.shutdown().await;
    };
    tokio::join!(a_to_b, b_to_a);
}
