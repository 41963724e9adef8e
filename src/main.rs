fn main() {
    chat_stream_lib::run()
}
